use directories::ProjectDirs;
use log::{debug, error};

use livesc::cli::Cli;
use livesc::config::{Config, CONFIG};
use livesc::logging::init_logging;

fn main() {
    let project_dirs = match ProjectDirs::from("", "", "livesc") {
        Some(dirs) => dirs,
        None => {
            eprintln!("Could not determine the livesc data directory");
            std::process::exit(1);
        }
    };

    let config = CONFIG.get_or_init(|| Config::load_config(&project_dirs));

    let log_dir = project_dirs.data_local_dir().join("logs");
    let _logger = match init_logging(&config.logging, &log_dir) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("Failed to start logging: {}", err);
            std::process::exit(1);
        }
    };
    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    if let Err(err) = Cli::handle_command_line(config) {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
