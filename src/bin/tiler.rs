//! Command-line driver: generate tiled geometry and report what was produced

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use surface_tiler::stats::{frame_row, StatsTable};
use surface_tiler::{
    Backend, BackendType, CapacityPolicy, DispatchConfig, FrameConfig, MeshSource, NormalMode,
    SessionConfig, ThreadGroupSize, TilerResult, TilingSession,
};

/// Backend selection for the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    /// wgpu if a GPU adapter is available, otherwise software
    #[default]
    Auto,
    /// Headless wgpu device
    Wgpu,
    /// CPU kernels, no GPU required
    Software,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliNormals {
    #[default]
    Flat,
    Interpolated,
}

impl From<CliNormals> for NormalMode {
    fn from(cli: CliNormals) -> Self {
        match cli {
            CliNormals::Flat => NormalMode::Flat,
            CliNormals::Interpolated => NormalMode::Interpolated,
        }
    }
}

/// Stamp a tile mesh across every triangle of a target mesh on the GPU.
#[derive(Parser, Debug)]
#[command(name = "tiler", version)]
struct Args {
    /// Target surface (OBJ). Defaults to a 4x4 grid with one tile per quad.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Tile mesh (OBJ) in unit cell space. Defaults to a small pyramid.
    #[arg(long)]
    tile: Option<PathBuf>,

    /// Device to run on.
    #[arg(long, default_value = "auto", value_enum)]
    backend: CliBackend,

    /// Threads per workgroup: 64, 128, 256 or 512.
    #[arg(long, default_value = "64")]
    group_size: u32,

    /// Drop tile triangles that fall entirely outside their target triangle.
    #[arg(long)]
    clipping: bool,

    /// Normal mode for generated vertices.
    #[arg(long, default_value = "flat", value_enum)]
    normals: CliNormals,

    /// Output vertex capacity. Worst case for the inputs when omitted.
    #[arg(long, requires = "max_indices")]
    max_vertices: Option<u32>,

    /// Output index capacity. Worst case for the inputs when omitted.
    #[arg(long, requires = "max_vertices")]
    max_indices: Option<u32>,

    /// Generation passes per configuration.
    #[arg(long, default_value = "1")]
    frames: usize,

    /// Run every thread group size instead of only --group-size.
    #[arg(long)]
    sweep: bool,

    /// Write per-frame statistics as CSV.
    #[arg(long)]
    stats: Option<PathBuf>,
}

fn create_backend(choice: CliBackend) -> TilerResult<Backend> {
    match choice {
        CliBackend::Wgpu => Ok(Backend::new(BackendType::Wgpu)?),
        CliBackend::Software => Ok(Backend::new(BackendType::Software)?),
        CliBackend::Auto => match Backend::new(BackendType::Wgpu) {
            Ok(backend) => Ok(backend),
            Err(err) => {
                log::warn!("wgpu unavailable ({}), falling back to software", err);
                Ok(Backend::new(BackendType::Software)?)
            }
        },
    }
}

fn run(args: Args) -> TilerResult<()> {
    let thread_group_sizes = if args.sweep {
        ThreadGroupSize::ALL.to_vec()
    } else {
        vec![ThreadGroupSize::try_from(args.group_size)?]
    };

    let defaults = SessionConfig::default();
    let config = SessionConfig {
        target: args.target.map(MeshSource::File).unwrap_or(defaults.target),
        tile: args.tile.map(MeshSource::File).unwrap_or(defaults.tile),
        capacity: match (args.max_vertices, args.max_indices) {
            (Some(max_vertices), Some(max_indices)) => CapacityPolicy::Fixed {
                max_vertices,
                max_indices,
            },
            _ => CapacityPolicy::WorstCase,
        },
    };

    let mut backend = create_backend(args.backend)?;
    log::info!("Using {} backend", backend.as_dyn_mut().name());
    let device = backend.as_dyn_mut();

    let mut session = TilingSession::new(device, &config)?;
    let mut table = StatsTable::for_frames();
    let mut frame_index = 0;

    let result = (|| -> TilerResult<()> {
        for thread_group_size in thread_group_sizes {
            let frame = FrameConfig {
                dispatch: DispatchConfig {
                    clipping: args.clipping,
                    normal_mode: args.normals.into(),
                    thread_group_size,
                },
            };
            for _ in 0..args.frames {
                let report = session.generate(device, &frame)?;
                log::info!(
                    "frame {} [group {}]: {} triangles, {} dropped, {:.3} ms",
                    frame_index,
                    thread_group_size,
                    report.generated.triangles(),
                    report.generated.dropped_triangles,
                    report.elapsed.as_secs_f64() * 1000.0
                );
                table.add_row(frame_row(frame_index, &report))?;
                frame_index += 1;
            }
        }
        Ok(())
    })();

    session.destroy(device);
    result?;

    if let Some(path) = args.stats {
        table.save(path)?;
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
