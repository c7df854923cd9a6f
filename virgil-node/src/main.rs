mod runtime;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use virgil_core::{list_config_files, NodeConfig};

fn init_logging() {
    use simplelog::*;

    let log_path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("virgil")
        .join("virgil.log");

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = File::create(&log_path)
        .unwrap_or_else(|_| File::create("/tmp/virgil.log").expect("Cannot create log file"));

    WriteLogger::init(LevelFilter::Info, Config::default(), log_file)
        .expect("Failed to initialize logger");

    log::info!("virgil node starting");
}

/// Interactive selection among the `.config` files in the working
/// directory.
fn choose_config() -> Option<PathBuf> {
    let files = match list_config_files(Path::new(".")) {
        Ok(files) => files,
        Err(e) => {
            eprintln!("Could not read the current directory: {e}");
            return None;
        }
    };
    if files.is_empty() {
        eprintln!("No .config files found in the current directory.");
        return None;
    }

    println!("Select a .config file:");
    for (index, file) in files.iter().enumerate() {
        println!("{}: {}", index + 1, file.display());
    }

    loop {
        print!("Enter the number of the file you want to use: ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        match line.trim().parse::<usize>() {
            Ok(choice) if (1..=files.len()).contains(&choice) => {
                return Some(files[choice - 1].clone());
            }
            _ => println!("Invalid selection."),
        }
    }
}

fn main() {
    init_logging();

    let Some(path) = choose_config() else {
        std::process::exit(1);
    };
    println!("You selected: {}", path.display());

    let config = match NodeConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("could not load {}: {e}", path.display());
            eprintln!("Could not load {}: {e}", path.display());
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime::run(config) {
        log::error!("fatal: {e}");
        eprintln!("Fatal error: {e}");
        std::process::exit(1);
    }
}
