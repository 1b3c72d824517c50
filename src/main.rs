use clap::Parser;
use log::LevelFilter;
use ruuvi_station::app::{self, Options};
use std::panic::{self, PanicHookInfo};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

#[tokio::main]
async fn main() {
    // Process managers (e.g. systemd) watch the exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();

    env_logger::Builder::new()
        .filter_level(if options.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    let mut stdout = std::io::stdout();
    match app::run(options, &mut stdout).await {
        Ok(()) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            log::error!("{}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
