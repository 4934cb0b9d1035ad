use crate::config::generate::generate_starter_config;
use crate::config::user_config_path;
use std::fs;
use std::path::PathBuf;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    write_config(&generate_starter_config(), stdout)
}

fn write_config(config_content: &str, stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Try to write to ~/.config/parchive/config.yml first
    let config_path = user_config_path().and_then(|user_config| {
        let parent = user_config.parent()?;
        match fs::create_dir_all(parent) {
            Ok(_) => Some(user_config),
            Err(_) => {
                eprintln!("Warning: Could not create directory {}", parent.display());
                eprintln!("Falling back to /etc/parchive/config.yml");
                None
            }
        }
    });
    let config_path = config_path.unwrap_or_else(|| PathBuf::from("/etc/parchive/config.yml"));

    if config_path.exists() {
        return Err(format!(
            "Config file already exists at {}\nRemove it first or use --stdout to print the config",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    match crate::config::load_config(&path) {
        Ok(_) => {
            println!("✓ Config is valid");
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Config validation failed:\n{}", e);
            std::process::exit(1);
        }
    }
}
