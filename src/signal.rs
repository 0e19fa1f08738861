//! Operator shutdown signals.

use std::fmt;

/// The signal that asked the pipeline to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Interrupt,
    Terminate,
    Quit,
}

impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Shutdown::Interrupt => "SIGINT",
            Shutdown::Terminate => "SIGTERM",
            Shutdown::Quit => "SIGQUIT",
        })
    }
}

/// Resolve with the first of SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn wait_for_shutdown() -> std::io::Result<Shutdown> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(tokio::select! {
        _ = interrupt.recv() => Shutdown::Interrupt,
        _ = terminate.recv() => Shutdown::Terminate,
        _ = quit.recv() => Shutdown::Quit,
    })
}

/// Resolve on ctrl-c, reported as an interrupt.
#[cfg(not(unix))]
pub async fn wait_for_shutdown() -> std::io::Result<Shutdown> {
    tokio::signal::ctrl_c().await?;
    Ok(Shutdown::Interrupt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_displays_signal_name() {
        assert_eq!(Shutdown::Interrupt.to_string(), "SIGINT");
        assert_eq!(Shutdown::Terminate.to_string(), "SIGTERM");
        assert_eq!(Shutdown::Quit.to_string(), "SIGQUIT");
    }
}
