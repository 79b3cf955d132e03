use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use liso::config::{Cli, Config};
use liso::daemon;
use liso::server::Server;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Arc::new(Config::from(cli));

    let _log_guard = match daemon::init_logging(&config.log_file) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to open log file {}: {e}", config.log_file.display());
            return ExitCode::FAILURE;
        }
    };

    let lock = match daemon::acquire_lock(&config.lock_file) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            tracing::info!("another instance already holds the lock, exiting");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to acquire lock file");
            return ExitCode::FAILURE;
        }
    };

    daemon::ignore_sigpipe_and_sigchld();
    let shutdown = match daemon::install_sigterm_flag() {
        Ok(flag) => flag,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return ExitCode::FAILURE;
        }
    };

    if !config.foreground {
        if let Err(e) = daemonize() {
            tracing::error!(error = %e, "failed to daemonize");
            return ExitCode::FAILURE;
        }
    }

    let mut server = match Server::bind(Arc::clone(&config), shutdown) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind listening socket");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(port = config.http_port, "liso listening");
    let result = server.run();
    drop(lock);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "event loop exited with error");
            ExitCode::FAILURE
        }
    }
}

/// Double-fork to detach from the controlling terminal, become a session
/// leader, and redirect the standard streams to `/dev/null`.
fn daemonize() -> std::io::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() == -1 {
            return Err(std::io::Error::last_os_error());
        }

        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        let devnull = std::ffi::CString::new("/dev/null").unwrap();
        let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
        if fd >= 0 {
            libc::dup2(fd, libc::STDIN_FILENO);
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
            if fd > libc::STDERR_FILENO {
                libc::close(fd);
            }
        }
    }
    Ok(())
}
