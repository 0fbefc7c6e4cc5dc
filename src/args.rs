use clap::{Parser, Subcommand};
use std::path::PathBuf;

use apelios_core::config::Config;

#[derive(Parser, Debug)]
#[command(name = "apelios-core")]
#[command(author = "Apelios Team")]
#[command(version)]
#[command(about = "Apelios streaming core: signaling relay, sender and receiver", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/apelios.toml")]
    pub config: PathBuf,

    /// Relay host (bind address for `relay`, connect address otherwise)
    #[arg(long)]
    pub host: Option<String>,

    /// Relay port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the WebSocket signaling relay
    Relay,

    /// Stream an H.264 source to every receiver that connects
    Send {
        /// Annex-B H.264 input file, "-" for stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Input frame rate
        #[arg(long)]
        fps: Option<u32>,

        /// Concurrent receiver sessions
        #[arg(long)]
        max_sessions: Option<usize>,
    },

    /// Receive the stream and write it to a file
    Receive {
        /// Output file, "-" for stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Seconds allowed for one frame
        #[arg(long)]
        frame_timeout: Option<f64>,
    },
}

impl Args {
    pub fn load_config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        Config::load(&self.config)
    }

    /// Apply command line overrides on top of the file configuration
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref host) = self.host {
            config.signaling.host = host.clone();
        }
        if let Some(port) = self.port {
            config.signaling.port = port;
        }

        match &self.command {
            Command::Relay => {}
            Command::Send {
                input,
                fps,
                max_sessions,
            } => {
                if let Some(input) = input {
                    config.sender.input = input.clone();
                }
                if let Some(fps) = fps {
                    config.sender.fps = *fps;
                }
                if let Some(max_sessions) = max_sessions {
                    config.sender.max_sessions = *max_sessions;
                }
            }
            Command::Receive {
                output,
                frame_timeout,
            } => {
                if let Some(output) = output {
                    config.receiver.output = output.clone();
                }
                if let Some(timeout) = frame_timeout {
                    config.receiver.frame_timeout_secs = *timeout;
                }
            }
        }
    }
}
