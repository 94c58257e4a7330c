//! pagecryptfs - Stackable filesystem with a page-level content transform
//!
//! Usage:
//!   pagecryptfs init --lower <dir>         - Write a configuration file
//!   pagecryptfs mount <mount_point>        - Mount the filesystem
//!   pagecryptfs unmount <mount_point>      - Unmount the filesystem
//!   pagecryptfs encode <input> <output>    - Transform a plain file offline
//!   pagecryptfs decode <input> <output>    - Recover a stored file offline
//!   pagecryptfs status                     - Show configuration and lower fs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pagecryptfs::{
    codec,
    config::Config,
    fs::StackFs,
    lower::{LowerFs, PassthroughFs},
    stack::{IoMode, UpperSuperblock},
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "pagecryptfs")]
#[command(author = "pagecryptfs Contributors")]
#[command(version)]
#[command(about = "Stackable filesystem that transforms file content page by page")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Cached,
    Passthrough,
}

impl From<ModeArg> for IoMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Cached => IoMode::Cached,
            ModeArg::Passthrough => IoMode::Passthrough,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new configuration file
    Init {
        /// Directory holding the stored (encoded) content
        #[arg(long)]
        lower: PathBuf,

        /// Default mount point
        #[arg(long)]
        mount_point: Option<PathBuf>,

        /// Codec shift
        #[arg(long)]
        delta: Option<u8>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Mount the filesystem
    Mount {
        /// Mount point directory (defaults to the configured one)
        mount_point: Option<PathBuf>,

        /// Lower directory (overrides the configured one)
        #[arg(long)]
        lower: Option<PathBuf>,

        /// How regular files move their content
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Encode a plain file into its stored form
    Encode {
        input: PathBuf,
        output: PathBuf,
    },

    /// Decode a stored file back into plain content
    Decode {
        input: PathBuf,
        output: PathBuf,
    },

    /// Show configuration and lower filesystem statistics
    Status,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose when set
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    let config_path = cli
        .config
        .map(|path| expand_tilde(&path))
        .unwrap_or_else(Config::default_path);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init {
            lower,
            mount_point,
            delta,
            force,
        } => cmd_init(config_path, lower, mount_point, delta, force),

        Commands::Mount {
            mount_point,
            lower,
            mode,
            allow_other,
        } => cmd_mount(config_path, mount_point, lower, mode, allow_other),

        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),

        Commands::Encode { input, output } => cmd_transform(config_path, &input, &output, true),

        Commands::Decode { input, output } => cmd_transform(config_path, &input, &output, false),

        Commands::Status => cmd_status(config_path),
    }
}

fn cmd_init(
    config_path: &Path,
    lower: PathBuf,
    mount_point: Option<PathBuf>,
    delta: Option<u8>,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut config = Config::default();
    config.mount.lower_path = expand_tilde(&lower);
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = expand_tilde(&mount_point);
    }
    if let Some(delta) = delta {
        config.codec.delta = delta;
    }
    config.validate()?;

    std::fs::create_dir_all(&config.mount.lower_path).with_context(|| {
        format!("creating lower directory {}", config.mount.lower_path.display())
    })?;
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Lower directory: {:?}", config.mount.lower_path);
    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    mount_point: Option<PathBuf>,
    lower: Option<PathBuf>,
    mode: Option<ModeArg>,
    allow_other: bool,
) -> Result<()> {
    let mut config = load_config(config_path, lower)?;
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = expand_tilde(&mount_point);
    }
    if let Some(mode) = mode {
        config.io.mode = mode.into();
    }
    config.mount.allow_other |= allow_other;
    config.validate()?;

    let mount_point = config.mount.mount_point.clone();
    if mount_point.as_os_str().is_empty() {
        bail!("no mount point given and none configured");
    }

    let lower_fs = PassthroughFs::new(config.mount.lower_path.clone())
        .with_context(|| format!("opening lower directory {:?}", config.mount.lower_path))?;
    let codec = codec::from_config(&config.codec)?;
    let sb = UpperSuperblock::mount(Arc::new(lower_fs), codec, config.stack_options())?;
    let fs = StackFs::new(sb)?;

    std::fs::create_dir_all(&mount_point)?;
    info!(
        "Mounting {:?} at {:?} ({:?} I/O)",
        config.mount.lower_path, mount_point, config.io.mode
    );

    let mut options = vec![
        fuser::MountOption::FSName("pagecryptfs".to_string()),
        fuser::MountOption::AutoUnmount,
    ];
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if config.mount.allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }

    fuser::mount2(fs, &mount_point, &options)
        .with_context(|| format!("mounting at {:?}", mount_point))?;
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()
        .context("running fusermount")?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()
        .context("running umount")?;

    if output.status.success() {
        info!("Unmounted successfully");
        Ok(())
    } else {
        bail!(
            "Unmount failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    }
}

/// Run the codec over a whole file, one page at a time
fn cmd_transform(config_path: &Path, input: &Path, output: &Path, encode: bool) -> Result<()> {
    let config = Config::load_or_default(config_path).unwrap_or_default();
    let codec = codec::from_config(&config.codec)?;

    let mut data =
        std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    codec::for_each_page(&mut data, |page| {
        if encode {
            codec.encode(page)
        } else {
            codec.decode(page)
        }
    });
    std::fs::write(output, &data).with_context(|| format!("writing {}", output.display()))?;

    info!(
        "{} {} bytes with {} into {:?}",
        if encode { "Encoded" } else { "Decoded" },
        data.len(),
        codec.name(),
        output
    );
    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path, None)?;

    println!("pagecryptfs Status");
    println!("==================");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Lower directory: {:?}", config.mount.lower_path);
    println!("Mount point: {:?}", config.mount.mount_point);
    println!("I/O mode: {:?}", config.io.mode);
    println!("Codec delta: {}", config.codec.delta);
    println!(
        "Cache: {}",
        match config.cache.max_pages {
            0 => "unbounded".to_string(),
            pages => format!("{} pages per file", pages),
        }
    );

    match PassthroughFs::new(config.mount.lower_path.clone()).and_then(|fs| fs.statfs()) {
        Ok(st) => {
            let bytes = |blocks: u64| blocks * st.frsize as u64 / 1024 / 1024;
            println!(
                "Lower filesystem: {} MB total, {} MB available",
                bytes(st.blocks),
                bytes(st.bavail)
            );
        }
        Err(e) => println!("Lower filesystem: unavailable - {}", e),
    }

    Ok(())
}

/// Load the configuration, letting `lower` stand in for a missing file
fn load_config(config_path: &Path, lower: Option<PathBuf>) -> Result<Config> {
    let mut config = if config_path.exists() {
        Config::load(config_path)?
    } else {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    };
    if let Some(lower) = lower {
        config.mount.lower_path = expand_tilde(&lower);
    }
    config
        .validate()
        .with_context(|| format!("configuration {:?}", config_path))?;
    Ok(config)
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
