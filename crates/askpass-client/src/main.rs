//! askpass-client - GIT_ASKPASS/SSH_ASKPASS helper for askpass-relay.
//!
//! git and ssh exec this binary with the prompt text as argument whenever
//! they need a credential. It forwards the prompt to the relay of the
//! invocation it runs under (found through the environment the spawner set
//! up) and prints the answer to stdout.
//!
//! # Contract
//!
//! - Answer: the secret's exact bytes on stdout, no trailing newline, exit 0
//! - Refusal, timeout, unreachable relay or missing environment: nothing on
//!   stdout, non-zero exit
//!
//! git and ssh treat a failed askpass as "no credential" and report their
//! own error, so a refusal prints nothing on stderr either.

use std::fs::File;
use std::io::{self, Write};
use std::process::ExitCode;

use askpass_relay_core::{ProtocolError, RelayClient, Response};
use secrecy::ExposeSecret;

/// Prompt used when invoked without arguments.
const DEFAULT_PROMPT: &str = "Password:";

/// Get the prompt text from command-line arguments.
///
/// git and ssh pass it as the only argument; anything beyond that is joined
/// back together.
fn prompt_from_args(args: impl IntoIterator<Item = String>) -> String {
    let args: Vec<String> = args.into_iter().skip(1).collect();
    if args.is_empty() {
        return DEFAULT_PROMPT.to_string();
    }
    args.join(" ")
}

/// Write the secret in one go and flush.
fn write_secret(out: &mut impl Write, secret: &[u8]) -> io::Result<()> {
    out.write_all(secret)?;
    out.flush()
}

/// Unbuffered handle on stdout.
///
/// [`io::Stdout`] is line buffered: a secret containing a newline would go
/// out in two writes, and a failed second write would leave half of it.
fn raw_stdout() -> io::Result<File> {
    #[cfg(unix)]
    let handle = {
        use std::os::fd::AsFd;
        io::stdout().as_fd().try_clone_to_owned()?
    };
    #[cfg(windows)]
    let handle = {
        use std::os::windows::io::AsHandle;
        io::stdout().as_handle().try_clone_to_owned()?
    };
    Ok(File::from(handle))
}

fn main() -> ExitCode {
    let client = match RelayClient::from_env() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("askpass-client: not running under askpass-relay: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let prompt = prompt_from_args(
        std::env::args_os().map(|arg| arg.to_string_lossy().into_owned()),
    );

    match client.request(&prompt) {
        Ok(Response::Answer(secret)) => {
            let secret = secret.expose_secret().as_bytes();
            let written = raw_stdout().and_then(|mut stdout| write_secret(&mut stdout, secret));
            match written {
                Ok(()) => ExitCode::SUCCESS,
                Err(_) => ExitCode::FAILURE,
            }
        }
        Ok(Response::Deny) => ExitCode::FAILURE,
        Err(ProtocolError::Timeout(ms)) => {
            eprintln!("askpass-client: no answer from relay within {} ms", ms);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("askpass-client: relay unavailable: {}", e);
            ExitCode::FAILURE
        }
    }
}
