//! One reconcile pass, for running from an external scheduler.

use clap::Parser;
use serde::Serialize;

use intellidial_lib::error::ErrorPayload;
use intellidial_lib::reconcile::{reconcile_all, reconcile_project};
use intellidial_lib::state::{self, AppState};

/// Reconcile calling contacts against the voice provider once and exit.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project to reconcile
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    project_id: Option<String>,

    /// Reconcile every project that has contacts mid-call
    #[arg(long)]
    all: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AllProjectsReport {
    synced_count: usize,
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Failed to encode report: {e}");
            std::process::exit(1);
        }
    }
}

fn fail(payload: ErrorPayload) -> ! {
    match serde_json::to_string(&payload) {
        Ok(json) => eprintln!("{json}"),
        Err(_) => eprintln!("{}", payload.message),
    }
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    intellidial_lib::init_logging();
    let cli = Cli::parse();

    let config = match state::load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    let db = match state::open_database(&config) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open database: {e}");
            std::process::exit(1);
        }
    };
    let app = AppState::new(config, db);

    match (cli.all, cli.project_id) {
        (true, _) => match reconcile_all(&app).await {
            Ok(synced_count) => print_json(&AllProjectsReport { synced_count }),
            Err(e) => fail(ErrorPayload::from(&e)),
        },
        (false, Some(project_id)) => match reconcile_project(&app, &project_id).await {
            Ok(report) => print_json(&report),
            Err(e) => fail(ErrorPayload::from(&e)),
        },
        (false, None) => {
            eprintln!("a project id or --all is required");
            std::process::exit(2);
        }
    }
}
