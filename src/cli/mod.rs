mod serve;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::config::AppConfig;
use crate::core::profile::classify;
use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Daemon")
        .command("serve", "Start the job orchestrator and HTTP API")
        .command("check-config", "Validate the configuration file")
        .print();

    GuideSection::new("Tools")
        .command("classify <model>", "Show how a device model is classified")
        .command("help", "Show this help")
        .print();

    GuideSection::new("Flags")
        .text("--config <path>    Config file (default: <data dir>/fwpilot.toml)")
        .text("--host <addr>      API listen address (serve)")
        .text("--port <port>      API listen port (serve)")
        .print();

    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style(NativePlatform::binary_name()).green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct ServeFlags {
    pub config: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub(crate) fn parse_serve_flags(args: &[String], start: usize) -> Result<ServeFlags> {
    let mut flags = ServeFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    flags.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--host" => {
                if i + 1 < args.len() {
                    flags.host = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--port" => {
                if i + 1 < args.len() {
                    let port = args[i + 1]
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid port '{}'", args[i + 1]))?;
                    flags.port = Some(port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    Ok(flags)
}

fn print_classification(model: &str) {
    let profile = classify(model);
    let section = GuideSection::new(&format!("Model {}", model.trim()))
        .status("Family", profile.family.as_str())
        .status("Filesystem", &profile.filesystem)
        .status("Stackable", if profile.stack_capable { "yes" } else { "no" })
        .status(
            "Image tag",
            profile.image_tag.as_deref().unwrap_or("(unknown)"),
        );
    section.print();
    if !profile.supported {
        terminal::print_warn("Model is not in the supported list; upgrades are refused.");
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let cmd = args[1].as_str();
    match cmd {
        "serve" => {
            let flags = parse_serve_flags(&args, 2)?;
            let config = flags.config.unwrap_or_else(AppConfig::default_path);
            serve::run_daemon(&config, flags.host, flags.port).await
        }
        "check-config" => {
            let flags = parse_serve_flags(&args, 2)?;
            let config = flags.config.unwrap_or_else(AppConfig::default_path);
            serve::check_config(&config).await
        }
        "classify" => {
            let Some(model) = args.get(2) else {
                print_error("Usage: classify <model>");
                return Ok(());
            };
            print_classification(model);
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
