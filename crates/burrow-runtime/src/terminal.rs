use std::io::Write as _;

pub fn print_enter_banner(name: &str, backend: &str) {
    if stderr_is_tty() {
        eprintln!("\x1b[1;36m[burrow]\x1b[0m entering \x1b[1m{name}\x1b[0m via {backend}");
        let _ = std::io::stderr().flush();
    }
}

pub fn print_exit_banner(name: &str) {
    if stderr_is_tty() {
        eprintln!("\x1b[1;36m[burrow]\x1b[0m left {name}");
    }
}

#[allow(unsafe_code)]
pub fn stderr_is_tty() -> bool {
    // SAFETY: isatty() is always safe — checks if fd is a terminal, no side effects.
    unsafe { libc::isatty(libc::STDERR_FILENO) != 0 }
}

#[allow(unsafe_code)]
pub fn stdin_is_tty() -> bool {
    // SAFETY: isatty() is always safe — checks if fd is a terminal, no side effects.
    unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banners_dont_panic() {
        // Output depends on whether stderr is a terminal; just exercise them.
        print_enter_banner("alpine:3.20", "docker");
        print_exit_banner("alpine:3.20");
    }
}
