//! askpass-setsid - Start a command as leader of a new session.
//!
//! The relay spawns git through this trampoline so the whole tree ends up in
//! a session and process group whose id is the pid the relay already knows.
//! A new session also detaches git and ssh from any controlling terminal,
//! so ssh can't fall back to reading `/dev/tty`.
//!
//! # Usage
//!
//! ```bash
//! askpass-setsid git fetch origin
//! ```
//!
//! Exit codes besides the command's own: 2 for usage errors, 1 if the
//! session can't be created, 127 if the command isn't found, 126 if it
//! can't be executed.

use std::process::ExitCode;

#[cfg(unix)]
fn main() -> ExitCode {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStringExt;

    use nix::errno::Errno;
    use nix::unistd::{execvp, setsid};

    let argv: Vec<CString> = match std::env::args_os()
        .skip(1)
        .map(|arg| CString::new(arg.into_vec()))
        .collect::<Result<_, _>>()
    {
        Ok(argv) => argv,
        Err(_) => {
            eprintln!("askpass-setsid: argument contains a NUL byte");
            return ExitCode::from(2);
        }
    };

    let Some(program) = argv.first() else {
        eprintln!("usage: askpass-setsid <command> [args...]");
        return ExitCode::from(2);
    };

    if let Err(e) = setsid() {
        eprintln!("askpass-setsid: setsid failed: {}", e);
        return ExitCode::FAILURE;
    }

    // Only returns on failure
    let Err(e) = execvp(program, &argv);
    eprintln!(
        "askpass-setsid: {}: {}",
        program.to_string_lossy(),
        e.desc()
    );
    match e {
        Errno::ENOENT => ExitCode::from(127),
        _ => ExitCode::from(126),
    }
}

#[cfg(not(unix))]
fn main() -> ExitCode {
    eprintln!("askpass-setsid is only used on Unix");
    ExitCode::FAILURE
}
