use std::path::PathBuf;

/// Command line arguments.
#[derive(Debug)]
pub(crate) struct Args {
    /// Path to the config file.
    pub(crate) config_path: PathBuf,

    /// A pre-bound, listening TCP socket inherited from a previous
    /// incarnation of the daemon. Used for zero-downtime restarts.
    pub(crate) listen_fd: Option<i32>,
}

/// Parses command line arguments and handles `--version` and `--help`.
pub(crate) fn parse() -> Args {
    let mut config_path: Option<PathBuf> = None;
    let mut listen_fd: Option<i32> = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-V" || arg == "--version" {
            print_version();
            std::process::exit(0);
        }

        if arg == "-h" || arg == "--help" {
            print_help();
            std::process::exit(0);
        }

        if arg == "-c" || arg == "--config" {
            match args.next() {
                Some(path) => {
                    config_path = Some(path.into());
                    continue;
                }
                None => {
                    eprintln!(
                        "Error: The argument '--config <FILE>' requires a file path but none was supplied"
                    );
                    eprintln!();
                    eprintln!("For more information try --help");
                    std::process::exit(1);
                }
            }
        }

        if arg == "--listen-fd" {
            match args.next().and_then(|fd| fd.parse().ok()) {
                Some(fd) => {
                    listen_fd = Some(fd);
                    continue;
                }
                None => {
                    eprintln!(
                        "Error: The argument '--listen-fd <FD>' requires a file descriptor number"
                    );
                    eprintln!();
                    eprintln!("For more information try --help");
                    std::process::exit(1);
                }
            }
        }

        eprintln!("Error: Found argument '{}' which wasn't expected", arg);
        eprintln!();
        eprintln!("For more information try --help");
        std::process::exit(1);
    }

    match config_path {
        Some(config_path) => Args {
            config_path,
            listen_fd,
        },
        None => {
            eprintln!("Error: The argument '--config <FILE>' is required");
            eprintln!();
            eprintln!("For more information try --help");
            std::process::exit(1);
        }
    }
}

fn print_version() {
    println!("shrike {}", env!("CARGO_PKG_VERSION"));
}

fn print_help() {
    print_version();
    let crate_description = env!("CARGO_PKG_DESCRIPTION");
    println!(
        "\
{crate_description}

USAGE:
    shrike --config <FILE> [--listen-fd <FD>]

OPTIONS:
    -c, --config <FILE>    Use this config file
        --listen-fd <FD>   Adopt a pre-bound listening socket (used by RESTART)
    -h, --help             Print help information
    -V, --version          Print version information",
    )
}
