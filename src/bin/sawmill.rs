#[macro_use]
extern crate log;

use chrono::Utc;
use sawmill::config::{self, Config, ConfigError, Mode};
use sawmill::constants;
use sawmill::engine::{RecordSink, StandardEngine, UniqueEngine};
use sawmill::http;
use sawmill::report::ReportHandler;
use sawmill::source::FileServer;
use sawmill::time;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn or_exit<T>(result: Result<T, ConfigError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            error!("could not configure sawmill: {}", e);
            process::exit(1);
        }
    }
}

fn serve<H>(port: u16, handler: Arc<H>) -> http::Server
where
    H: http::Handler + 'static,
{
    match http::Server::bind(&format!("0.0.0.0:{}", port), handler, 4) {
        Ok(server) => server,
        Err(e) => {
            error!("could not bind port {}: {}", port, e);
            process::exit(1);
        }
    }
}

fn spawn_tailers(globs: &[String], discover_interval: Duration, sink: Arc<dyn RecordSink>) {
    for pattern in globs {
        let sink = Arc::clone(&sink);
        let mut server = FileServer::new(
            vec![pattern.clone()],
            discover_interval,
            constants::MAX_LINES_READ,
        );
        thread::spawn(move || server.run(sink));
    }
}

fn run_standard(config: &Config, globs: &[String]) -> http::Server {
    let engine = Arc::new(or_exit(StandardEngine::new(&config.metrics)));
    info!("standard mode with {} metrics", config.metrics.len());
    spawn_tailers(
        globs,
        Duration::from_secs(constants::STANDARD_DISCOVER_INTERVAL_SECS),
        Arc::clone(&engine) as Arc<dyn RecordSink>,
    );
    serve(
        constants::STANDARD_PORT,
        Arc::new(http::StandardHandler::new(engine)),
    )
}

fn run_unique(config: &Config, globs: &[String]) -> http::Server {
    let (notify, gate) = http::alert_gate();
    let engine = Arc::new(or_exit(UniqueEngine::with_notify(&config.unique, notify)));
    info!("unique mode with {} metrics", config.unique.len());

    let purge_engine = Arc::clone(&engine);
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(constants::PURGE_INTERVAL_SECS));
        purge_engine.purge(time::now());
    });

    spawn_tailers(
        globs,
        Duration::from_secs(constants::UNIQUE_DISCOVER_INTERVAL_SECS),
        Arc::clone(&engine) as Arc<dyn RecordSink>,
    );
    serve(
        constants::UNIQUE_PORT,
        Arc::new(http::UniqueHandler::new(engine, gate)),
    )
}

fn run_report(config: Config) -> http::Server {
    let report_config = match config.nel {
        Some(rc) => rc,
        None => {
            error!("nel mode requires a nel configuration section");
            process::exit(1);
        }
    };
    info!(
        "report mode appending to {:?} and {:?}",
        report_config.nel_report_log, report_config.csp_report_log
    );
    serve(
        constants::REPORT_PORT,
        Arc::new(ReportHandler::new(&report_config)),
    )
}

fn main() {
    let args = config::parse_args();

    let level = match args.verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let signal =
        chan_signal::notify(&[chan_signal::Signal::INT, chan_signal::Signal::TERM]);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}][{}] {}",
                record.module_path().unwrap_or("-"),
                record.line().unwrap_or(0),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("could not set up logging");

    info!("sawmill - {}", env!("CARGO_PKG_VERSION"));

    let config = or_exit(config::load_config(&args.config_path));

    // held for the life of the process; dropping it would close the listener
    let _server = match args.mode {
        Mode::Standard => run_standard(&config, &args.globs),
        Mode::Unique => run_unique(&config, &args.globs),
        Mode::Report => run_report(config),
    };

    signal.recv().expect("signal channel hung up");
    info!("shutting down");
}
