//! khor daemon entry point
//!
//! Loads the config, applies CLI overrides, starts the coordinator and the
//! control plane, then waits for SIGINT. Exit code 2 means an argument or
//! configuration problem; everything else degrades soft and shows up in
//! `/api/health` instead.

use clap::Parser;
use khor::app::App;
use khor::config::Config;
use khor::http::HttpServer;
use std::path::PathBuf;
use std::process::exit;
use std::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(name = "khor")]
#[command(about = "Sonifies Linux kernel activity in real time", long_about = None)]
struct Cli {
    /// Config file path (default: XDG config path)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override listen address (HOST:PORT)
    #[arg(long)]
    listen: Option<String>,

    /// Serve the UI from this directory
    #[arg(long = "ui-dir")]
    ui_dir: Option<PathBuf>,

    /// Disable the eBPF collector
    #[arg(long = "no-bpf")]
    no_bpf: bool,

    /// Disable audio output
    #[arg(long = "no-audio")]
    no_audio: bool,

    /// Enable MIDI output
    #[arg(long)]
    midi: bool,

    /// Enable OSC output
    #[arg(long)]
    osc: bool,

    /// Enable fake metrics when the probe is unavailable
    #[arg(long)]
    fake: bool,
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);

    let mut cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("khor: {e}");
            exit(2);
        }
    };

    if let Some(listen) = &cli.listen {
        match listen.rsplit_once(':').and_then(|(host, port)| {
            port.parse::<u16>().ok().filter(|p| *p > 0).map(|p| (host.to_string(), p))
        }) {
            Some((host, port)) => {
                cfg.listen.host = host;
                cfg.listen.port = port;
            }
            None => {
                eprintln!("khor: invalid --listen (expected HOST:PORT): {listen}");
                exit(2);
            }
        }
    }
    if let Some(ui_dir) = &cli.ui_dir {
        cfg.ui.dir = ui_dir.display().to_string();
        cfg.ui.serve = true;
    }
    if cli.no_bpf {
        cfg.features.bpf = false;
    }
    if cli.no_audio {
        cfg.features.audio = false;
    }
    if cli.midi {
        cfg.features.midi = true;
    }
    if cli.osc {
        cfg.features.osc = true;
    }
    if cli.fake {
        cfg.features.fake = true;
    }

    let addr = format!("{}:{}", cfg.listen.host, cfg.listen.port);
    let ui_dir = if cfg.ui.serve && !cfg.ui.dir.is_empty() {
        Some(PathBuf::from(&cfg.ui.dir))
    } else {
        None
    };

    let app = App::new(config_path, cfg);
    app.start();

    let http = match HttpServer::start(app.clone(), &addr, ui_dir) {
        Ok(http) => http,
        Err(e) => {
            eprintln!("khor: {e}");
            app.stop();
            exit(2);
        }
    };

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    }) {
        eprintln!("khor: failed to install signal handler: {e}");
        app.stop();
        exit(2);
    }

    info!("running; ctrl-c to stop");
    let _ = stop_rx.recv();

    info!("shutting down");
    app.stop();
    http.stop();
}
