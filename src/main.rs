mod cli;
mod client;
mod config;
mod conn;
mod daemon;
mod flood;
mod kline;
mod listen;
mod numeric;
mod s2s;
mod signals;
mod state;
mod ticker;
mod utils;

use daemon::ExitAction;
use libshrike_common::Sid;

use std::net::TcpListener as StdTcpListener;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::exit;

#[macro_use]
extern crate log;

fn main() {
    let args = cli::parse();

    env_logger::Builder::from_env(env_logger::Env::new().filter_or("SHRIKE_LOG", "info")).init();

    let config = match config::parse_config(&args.config_path) {
        Err(err) => {
            println!("Can't parse config file:");
            println!("{}", err);
            exit(1);
        }
        Ok(config) => config,
    };

    let config_errors = config.validate();
    if !config_errors.is_empty() {
        println!(
            "Config file error{}:",
            if config_errors.len() > 1 { "s" } else { "" }
        );
        for error in config_errors {
            println!("- {}", error);
        }
        exit(1);
    }

    let tables = match config::load_tables(&config) {
        Err(err) => {
            println!("Can't load configuration tables:");
            println!("{}", err);
            exit(1);
        }
        Ok(tables) => tables,
    };

    // Shape already checked by validate().
    let sid = match Sid::new(&config.ts6_sid) {
        None => {
            println!("Bad ts6-sid: {}", config.ts6_sid);
            exit(1);
        }
        Some(sid) => sid,
    };

    // Plain listener: adopt the inherited socket when restarting, bind a
    // fresh one otherwise.
    let std_listener = match args.listen_fd {
        Some(fd) => {
            // Safety: the previous incarnation passed a bound, listening
            // TCP socket in this descriptor.
            unsafe { StdTcpListener::from_raw_fd(fd) }
        }
        None => {
            match StdTcpListener::bind((config.listen_host.as_str(), config.listen_port)) {
                Err(err) => {
                    println!(
                        "Can't listen on {}:{}: {}",
                        config.listen_host, config.listen_port, err
                    );
                    exit(1);
                }
                Ok(listener) => listener,
            }
        }
    };
    if let Err(err) = std_listener.set_nonblocking(true) {
        println!("Can't make the listener non-blocking: {}", err);
        exit(1);
    }
    // Kept aside so RESTART can hand the socket to the next incarnation.
    let restart_listener = std_listener.try_clone().ok();

    let tls_parts = match config.listen_port_tls {
        None => None,
        Some(port) => {
            let (cert_file, key_file) = match (&config.certificate_file, &config.key_file) {
                (Some(cert), Some(key)) => (cert.clone(), key.clone()),
                // validate() refuses a TLS port without the file pair.
                _ => {
                    println!("listen-port-tls requires certificate-file and key-file");
                    exit(1);
                }
            };
            let acceptor = match listen::tls_acceptor(&cert_file, &key_file) {
                Err(err) => {
                    println!("Can't set up TLS: {}", err);
                    exit(1);
                }
                Ok(acceptor) => acceptor,
            };
            let listener = match StdTcpListener::bind((config.listen_host.as_str(), port)) {
                Err(err) => {
                    println!("Can't listen on {}:{}: {}", config.listen_host, port, err);
                    exit(1);
                }
                Ok(listener) => listener,
            };
            if let Err(err) = listener.set_nonblocking(true) {
                println!("Can't make the TLS listener non-blocking: {}", err);
                exit(1);
            }
            Some((listener, acceptor))
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Err(err) => {
            println!("Can't build the runtime: {}", err);
            exit(1);
        }
        Ok(runtime) => runtime,
    };

    let action = runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(std_listener) {
            Err(err) => {
                error!("can't register the listener: {}", err);
                return ExitAction::Fatal;
            }
            Ok(listener) => listener,
        };
        let tls = match tls_parts {
            None => None,
            Some((std_tls_listener, acceptor)) => {
                match tokio::net::TcpListener::from_std(std_tls_listener) {
                    Err(err) => {
                        error!("can't register the TLS listener: {}", err);
                        return ExitAction::Fatal;
                    }
                    Ok(tls_listener) => Some((tls_listener, acceptor)),
                }
            }
        };
        daemon::run(config, tables, sid, listener, tls).await
    });
    drop(runtime);

    match action {
        ExitAction::Quit => {}
        ExitAction::Fatal => exit(1),
        ExitAction::Restart => reexec(&args.config_path, restart_listener),
    }
}

/// Replaces this process with a fresh copy of the binary, handing over the
/// plain listening socket so no connection attempt is ever refused.
fn reexec(config_path: &Path, listener: Option<StdTcpListener>) -> ! {
    let exe = std::env::current_exe().unwrap_or_else(|_| "shrike".into());
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("--config").arg(config_path);
    if let Some(listener) = listener {
        let fd: RawFd = listener.into_raw_fd();
        // Clear FD_CLOEXEC so the socket survives the exec.
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, 0);
        }
        cmd.arg("--listen-fd").arg(fd.to_string());
    }
    let err = cmd.exec();
    eprintln!("exec failed: {}", err);
    exit(1);
}
