//! Poise balance controller CLI.
//!
//! Provides three modes of operation:
//! - `check`: Validate a controller configuration against the reference biped
//! - `stand`: Run the controller headless on the reference biped and print a trace
//! - `info`: Print workspace crate versions

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nalgebra::DVector;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use poise_core::config::ControllerConfig;
use poise_core::traits::RigidBodyDynamics;
use poise_model::biped::{L_FOOT, R_FOOT};
use poise_model::PointFootBiped;
use poise_qp::{QpController, QpInput, SupportData, TickError, TickInput};

const BUNDLED_CONFIG: &str = include_str!("../../../configs/point_foot_biped.toml");

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Whole-body QP balance controller.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Log controller internals at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and bind it to the reference biped.
    Check {
        /// Path to the TOML configuration.
        config: PathBuf,
    },

    /// Balance the reference biped after a push and print a trace.
    Stand {
        /// Configuration file. Defaults to the bundled biped configuration.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Parameter set to run.
        #[arg(short, long, default_value = "standing")]
        param_set: String,

        /// Number of control ticks.
        #[arg(short = 'n', long, default_value_t = 500)]
        ticks: u32,

        /// Control period in seconds.
        #[arg(long, default_value_t = 0.002)]
        dt: f64,

        /// Initial lateral pelvis velocity (m/s).
        #[arg(long, default_value_t = 0.2)]
        push: f64,

        /// Print every k-th tick.
        #[arg(long, default_value_t = 50)]
        every: u32,

        /// Write the last tick's debug snapshot as JSON.
        #[arg(long)]
        debug_json: Option<PathBuf>,
    },

    /// Print crate information.
    Info,
}

// ---------------------------------------------------------------------------
// Mode implementations
// ---------------------------------------------------------------------------

fn load_config(path: Option<&Path>) -> Result<ControllerConfig, Box<dyn Error>> {
    let config = match path {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::from_toml_str(BUNDLED_CONFIG)?,
    };
    Ok(config)
}

fn run_check(path: &Path) -> Result<(), Box<dyn Error>> {
    let config = load_config(Some(path))?;
    let model = PointFootBiped::default();
    let controller = QpController::from_config(&model, &config)?;
    println!("{}: ok", path.display());
    println!(
        "robot: {} (nv={}, nu={}, feet={})",
        model.name(),
        controller.robot().nv,
        controller.robot().nu(),
        controller.robot().feet.len()
    );
    println!(
        "parameter sets: {}",
        config.param_sets.names().collect::<Vec<_>>().join(", ")
    );
    Ok(())
}

struct StandOptions {
    config: Option<PathBuf>,
    param_set: String,
    ticks: u32,
    dt: f64,
    push: f64,
    every: u32,
    debug_json: Option<PathBuf>,
}

fn run_stand(opts: &StandOptions) -> Result<(), Box<dyn Error>> {
    let mut config = load_config(opts.config.as_deref())?;
    config.controller.capture_debug = opts.debug_json.is_some();
    let model = PointFootBiped::default();
    let mut controller = QpController::from_config(&model, &config)?;

    let q_des = model.standing_configuration();
    let mut q = q_des.clone();
    let mut qd = DVector::zeros(q.len());
    qd[1] = opts.push;
    let supports = vec![SupportData::point(L_FOOT, 0.8), SupportData::point(R_FOOT, 0.8)];

    println!("tick     t      pelvis_y  pelvis_z  u_l_knee  u_r_knee  solver");
    let mut last_debug = None;
    for tick in 0..opts.ticks {
        let input = TickInput {
            t: f64::from(tick) * opts.dt,
            q: q.clone(),
            qd: qd.clone(),
            contact_sensed: vec![true, true],
            command: QpInput::hold(opts.param_set.clone(), q_des.clone(), supports.clone()),
        };

        // Commanded accelerations are applied exactly (ideal actuation).
        let qdd = match controller.tick(&model, &input) {
            Ok(out) => {
                if tick % opts.every == 0 {
                    println!(
                        "{tick:>4}  {:>6.3}  {:>8.4}  {:>8.4}  {:>8.2}  {:>8.2}  {:?}",
                        input.t, q[1], q[2], out.output.u[2], out.output.u[6], out.solver
                    );
                }
                if out.debug.is_some() {
                    last_debug = out.debug;
                }
                out.output.qdd
            }
            Err(err @ TickError::SolverFailure { .. }) => {
                println!("{tick:>4}  fail-safe: {err}");
                err.fallback_output()
                    .map_or_else(|| DVector::zeros(q.len()), |out| out.qdd.clone())
            }
            Err(err) => return Err(err.into()),
        };

        qd += &qdd * opts.dt;
        q += &qd * opts.dt;
    }

    let stats = controller.stats();
    println!();
    println!(
        "solves={} fast={} warm={} robust={} failures={}",
        stats.solves, stats.fast_accepted, stats.warm_starts, stats.robust_accepted, stats.failures
    );
    println!("final pelvis offset: {:.5} m", (q[1] - q_des[1]).abs());

    if let (Some(path), Some(debug)) = (&opts.debug_json, last_debug) {
        std::fs::write(path, serde_json::to_string_pretty(&debug)?)?;
        println!("debug snapshot written to {}", path.display());
    }
    Ok(())
}

fn run_info() {
    println!("poise v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("crates:");
    println!("  poise-core   {}", env!("CARGO_PKG_VERSION"));
    println!("  poise-qp     {}", env!("CARGO_PKG_VERSION"));
    println!("  poise-model  {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("qp backends: active-set (fast), clarabel (robust)");
    println!("edition: 2024");
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

fn setup_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let result = match cli.command {
        Some(Commands::Check { config }) => run_check(&config),
        Some(Commands::Stand {
            config,
            param_set,
            ticks,
            dt,
            push,
            every,
            debug_json,
        }) => run_stand(&StandOptions {
            config,
            param_set,
            ticks,
            dt,
            push,
            every: every.max(1),
            debug_json,
        }),
        Some(Commands::Info) => {
            run_info();
            Ok(())
        }
        None => {
            // Default: short standing run with the bundled configuration
            run_stand(&StandOptions {
                config: None,
                param_set: "standing".into(),
                ticks: 500,
                dt: 0.002,
                push: 0.2,
                every: 50,
                debug_json: None,
            })
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
