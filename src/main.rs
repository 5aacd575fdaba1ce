//! # Wainlux CLI
//!
//! Command-line interface for the Wainlux K6 laser engraver.
//!
//! ## Usage
//!
//! ```bash
//! # Check the connection and firmware version
//! wainlux status
//!
//! # Burn an image at depth 80
//! wainlux burn --depth 80 logo.png
//!
//! # See what would be sent, without a device
//! wainlux plan logo.png
//! wainlux --dry-run burn logo.png
//!
//! # Save the 1-bit raster as PNG
//! wainlux preview logo.png --png out.png
//!
//! # Calibration pattern and Wi-Fi card
//! wainlux pattern grid --png grid.png
//! wainlux qr --ssid Home --password hunter22 --burn
//!
//! # Head control
//! wainlux home
//! wainlux jog --x 800 --y 760
//! wainlux frame --width 400 --height 300
//! ```
//!
//! `--mock` swaps the serial port for a simulated engraver. Flags override
//! `WAINLUX_PORT`, `WAINLUX_MOCK` and `WAINLUX_DRY_RUN`.

use clap::{Args, Parser, Subcommand, ValueEnum};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use wainlux::{
    Config, EventBus, JobController, JobRequest, WainluxError,
    job::StopOutcome,
    protocol::plan::CommandPlan,
    raster::{self, LaserColor, PrepareOptions, RasterJobInput},
    render::{
        patterns,
        qr::{self, WifiSecurity},
    },
};

/// Wainlux - K6 laser engraver utility
#[derive(Parser, Debug)]
#[command(name = "wainlux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial device path
    #[arg(long, global = true)]
    port: Option<String>,

    /// Use the simulated engraver
    #[arg(long, global = true)]
    mock: bool,

    /// Run jobs without any device I/O
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Image pipeline knobs shared by burn, plan and preview.
#[derive(Args, Debug, Clone)]
struct RasterArgs {
    /// Luminance cutoff; darker pixels burn
    #[arg(long, default_value_t = raster::DEFAULT_THRESHOLD)]
    threshold: u8,

    /// Burn light areas instead of dark ones
    #[arg(long)]
    invert: bool,

    /// Grayscale weighting (neutral, blue, red, green)
    #[arg(long, default_value = "neutral")]
    laser: LaserColor,

    /// Canvas width in device units
    #[arg(long)]
    max_width: Option<u32>,

    /// Canvas height in device units
    #[arg(long)]
    max_height: Option<u32>,
}

/// Burn parameters.
#[derive(Args, Debug, Clone)]
struct BurnArgs {
    /// Burn depth (1-255)
    #[arg(long)]
    depth: Option<u8>,

    /// Laser power (0-1000)
    #[arg(long)]
    power: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and show device status
    Status,

    /// Burn an image
    Burn {
        image: PathBuf,

        #[command(flatten)]
        raster: RasterArgs,

        #[command(flatten)]
        burn: BurnArgs,
    },

    /// List the frames a burn would send
    Plan {
        image: PathBuf,

        #[command(flatten)]
        raster: RasterArgs,

        #[command(flatten)]
        burn: BurnArgs,
    },

    /// Save the prepared 1-bit raster as PNG
    Preview {
        image: PathBuf,

        /// Output file
        #[arg(long, value_name = "FILE")]
        png: PathBuf,

        #[command(flatten)]
        raster: RasterArgs,
    },

    /// Render a calibration pattern (omit the name to list them)
    Pattern {
        name: Option<String>,

        /// Feature size in millimetres
        #[arg(long, default_value_t = patterns::DEFAULT_SIZE_MM)]
        size_mm: f32,

        /// Save to PNG instead of burning
        #[arg(long, value_name = "FILE")]
        png: Option<PathBuf>,

        #[command(flatten)]
        burn: BurnArgs,
    },

    /// Render a Wi-Fi QR card
    Qr {
        #[arg(long)]
        ssid: String,

        #[arg(long, default_value = "")]
        password: String,

        /// WPA, WEP or none
        #[arg(long, default_value = "WPA")]
        security: WifiSecurity,

        /// Save to PNG instead of burning
        #[arg(long, value_name = "FILE")]
        png: Option<PathBuf>,

        #[command(flatten)]
        burn: BurnArgs,
    },

    /// Move the head to its home position
    Home,

    /// Move the head to a position in device units
    Jog {
        #[arg(long)]
        x: u32,

        #[arg(long)]
        y: u32,
    },

    /// Trace the outline of a burn area
    Frame {
        #[arg(long)]
        width: u32,

        #[arg(long)]
        height: u32,
    },

    /// Switch the positioning crosshair
    Crosshair {
        #[arg(value_enum)]
        state: Toggle,
    },

    /// Stop the device
    Stop,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), WainluxError> {
    let cli = Cli::parse();
    let config = Arc::new(resolve_config(&cli));
    let json = cli.json;

    match cli.command {
        Commands::Status => {
            let controller = JobController::from_config(Arc::clone(&config), EventBus::new());
            let probe = controller.clone();
            let connected = tokio::task::spawn_blocking(move || probe.connect())
                .await
                .map_err(task_error)?;
            if let Err(e) = connected {
                log::warn!("Device not reachable: {}", e);
            }
            let status = controller.status();
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Port:      {}", status.port);
                println!("Mode:      {}", config.operation_mode());
                println!("State:     {:?}", status.state);
                println!("Connected: {}", status.connected);
                println!(
                    "Firmware:  {}",
                    status.firmware.as_deref().unwrap_or("unknown")
                );
                println!("Work area: {}x{}", status.max_width, status.max_height);
            }
        }

        Commands::Burn { image, raster, burn } => {
            let source = load_image(&image)?;
            burn_image(config, source, &raster, &burn, json).await?;
        }

        Commands::Plan { image, raster, burn } => {
            let source = load_image(&image)?;
            let prepared = prepare(&source, &raster, &burn)?;
            let plan = CommandPlan::for_job(&prepared)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                println!("Plan for {}", image.display());
                println!("{}", plan.summary());
            }
        }

        Commands::Preview { image, png, raster } => {
            let source = load_image(&image)?;
            let prepared = prepare(&source, &raster, &BurnArgs::none())?;
            std::fs::write(&png, prepared.to_png()?)?;
            println!(
                "Saved {}x{} raster ({:.1}% burn) to {}",
                prepared.width,
                prepared.height,
                prepared.stats.burn_percentage,
                png.display()
            );
        }

        Commands::Pattern {
            name,
            size_mm,
            png,
            burn,
        } => {
            let Some(name) = name else {
                println!("Available patterns:");
                for name in patterns::list_patterns() {
                    println!("  {}", name);
                }
                return Ok(());
            };
            println!("Generating {} pattern...", name);
            let img = patterns::render_named(&name, size_mm)?;
            output(config, DynamicImage::ImageLuma8(img), png, &burn, json).await?;
        }

        Commands::Qr {
            ssid,
            password,
            security,
            png,
            burn,
        } => {
            let img = qr::render_wifi_qr(&ssid, &password, security)?;
            output(config, DynamicImage::ImageLuma8(img), png, &burn, json).await?;
        }

        Commands::Home => control(config, |c| c.home()).await?,

        Commands::Jog { x, y } => control(config, move |c| c.jog(x, y)).await?,

        Commands::Frame { width, height } => {
            control(config, move |c| c.frame(width, height)).await?
        }

        Commands::Crosshair { state } => {
            control(config, move |c| c.crosshair(state == Toggle::On)).await?
        }

        Commands::Stop => {
            let outcome = control(config, |c| c.stop()).await?;
            if let StopOutcome::CancelledJob(id) = outcome {
                println!("Cancelled job {}", id);
            }
        }
    }

    Ok(())
}

impl BurnArgs {
    fn none() -> Self {
        Self {
            depth: None,
            power: None,
        }
    }
}

fn resolve_config(cli: &Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(port) = &cli.port {
        config.port = port.clone();
    }
    config.mock |= cli.mock;
    config.dry_run |= cli.dry_run;
    config
}

fn options(raster: &RasterArgs, burn: &BurnArgs) -> PrepareOptions {
    let defaults = PrepareOptions::default();
    PrepareOptions {
        max_width: raster.max_width.unwrap_or(defaults.max_width),
        max_height: raster.max_height.unwrap_or(defaults.max_height),
        threshold: raster.threshold,
        invert: raster.invert,
        laser_color: raster.laser,
        depth: burn.depth,
        power: burn.power,
    }
}

fn load_image(path: &Path) -> Result<DynamicImage, WainluxError> {
    let bytes = std::fs::read(path)?;
    Ok(raster::decode(&bytes)?)
}

fn prepare(
    source: &DynamicImage,
    raster_args: &RasterArgs,
    burn: &BurnArgs,
) -> Result<RasterJobInput, WainluxError> {
    Ok(raster::prepare(source, &options(raster_args, burn))?)
}

fn task_error(e: tokio::task::JoinError) -> WainluxError {
    WainluxError::InvalidArgument(format!("Task error: {}", e))
}

/// Save a generated image to PNG, or burn it.
async fn output(
    config: Arc<Config>,
    img: DynamicImage,
    png: Option<PathBuf>,
    burn: &BurnArgs,
    json: bool,
) -> Result<(), WainluxError> {
    match png {
        Some(path) => {
            img.save(&path)
                .map_err(|e| WainluxError::Image(format!("Failed to save PNG: {}", e)))?;
            println!("Saved to {}", path.display());
            Ok(())
        }
        None => {
            let raster = RasterArgs {
                threshold: raster::DEFAULT_THRESHOLD,
                invert: false,
                laser: LaserColor::Neutral,
                max_width: None,
                max_height: None,
            };
            burn_image(config, img, &raster, burn, json).await
        }
    }
}

/// Submit a burn job and stream its progress until it finishes. Ctrl-C
/// cancels the job at the next line boundary.
async fn burn_image(
    config: Arc<Config>,
    source: DynamicImage,
    raster: &RasterArgs,
    burn: &BurnArgs,
    json: bool,
) -> Result<(), WainluxError> {
    let controller = JobController::from_config(config, EventBus::new());
    let mut request = JobRequest::from_image(source);
    request.options = options(raster, burn);
    let id = request.id;

    // Subscribe first so no event is missed
    let mut events = controller.subscribe(id);
    let handle = controller.submit(request)?;
    println!("Job {}", id);

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => log::warn!("Could not serialize event: {}", e),
                }
            } else {
                println!("[{:>8}] {:>3}% {}", event.phase, event.percent, event.message);
            }
            if event.is_terminal() {
                break;
            }
        }
    });

    let canceller = controller.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling at the next line...");
            canceller.cancel(id);
        }
    });

    let outcome = tokio::task::spawn_blocking(move || handle.wait())
        .await
        .map_err(task_error)?;
    ctrl_c.abort();
    if let Err(e) = printer.await {
        log::warn!("Progress printer failed: {}", e);
    }

    let job = outcome?;
    if !json {
        println!("Burn complete ({:?})", job.phase);
    }
    Ok(())
}

/// Connect, then run one control operation.
async fn control<T, F>(config: Arc<Config>, op: F) -> Result<T, WainluxError>
where
    T: Send + 'static,
    F: FnOnce(&JobController) -> Result<T, wainlux::error::JobError> + Send + 'static,
{
    let controller = JobController::from_config(config, EventBus::new());
    let result = tokio::task::spawn_blocking(move || {
        let firmware = controller.connect()?;
        log::info!("Connected (firmware {})", firmware);
        let value = op(&controller)?;
        println!("OK");
        Ok::<_, wainlux::error::JobError>(value)
    })
    .await
    .map_err(task_error)?;
    Ok(result?)
}
