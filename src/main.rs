//! DistGpu 压力测试
//!
//! 反复上传、复制、读回缓冲区并校验内容，可以周期性地模拟设备丢失来检验重置流程。
//!
//! # 使用方法
//!
//! ```bash
//! # 软件后端，100 帧，每 25 帧模拟一次设备丢失
//! cargo run -- --soft --frames 100 --reset-every 25
//!
//! # 使用更小的显存预算观察驻留调度
//! cargo run -- --soft --budget 8388608 --log-level debug
//! ```
//!
//! # 命令行参数
//!
//! - `--frames <n>`：运行的帧数（默认 60）
//! - `--reset-every <n>`：每 n 帧模拟一次设备丢失（默认不模拟）
//! - 其余参数见 `Config::apply_args`

use anyhow::{bail, Context};
use tracing::{error, info};

use dist_gpu::core::{log, Config};
use dist_gpu::gfx::backend::{ResourceDesc, ResourceStates};
use dist_gpu::gfx::create_backend;
use dist_gpu::renderer::{GraphicsContext, Resource};

const BUFFER_SIZE: u64 = 256 * 1024;
const BUFFER_COUNT: usize = 8;

struct SoakArgs {
    frames: u64,
    reset_every: Option<u64>,
}

impl SoakArgs {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let value = |name: &str| -> anyhow::Result<Option<u64>> {
            match args.iter().position(|a| a == name) {
                Some(i) => {
                    let raw = args.get(i + 1).with_context(|| format!("{} requires a value", name))?;
                    let parsed = raw.parse().with_context(|| format!("invalid value for {}: {}", name, raw))?;
                    Ok(Some(parsed))
                }
                None => Ok(None),
            }
        };

        Ok(Self {
            frames: value("--frames")?.unwrap_or(60),
            reset_every: value("--reset-every")?.filter(|&n| n > 0),
        })
    }
}

fn pattern(frame: u64, index: usize) -> Vec<u8> {
    (0..BUFFER_SIZE).map(|i| (i as u64 ^ frame.wrapping_mul(31) ^ index as u64) as u8).collect()
}

fn run(config: Config, soak: SoakArgs) -> anyhow::Result<()> {
    let backend = create_backend(&config).context("failed to create backend")?;
    let mut ctx = GraphicsContext::new(config, backend).context("failed to create graphics context")?;

    let sources: Vec<Resource> = (0..BUFFER_COUNT)
        .map(|i| Resource::new(&ctx, &format!("source {}", i), ResourceDesc::buffer(BUFFER_SIZE), ResourceStates::COMMON))
        .collect::<Result<_, _>>()?;
    let targets: Vec<Resource> = (0..BUFFER_COUNT)
        .map(|i| {
            Resource::committed(&ctx, &format!("target {}", i), ResourceDesc::buffer(BUFFER_SIZE), ResourceStates::COMMON)
        })
        .collect::<Result<_, _>>()?;

    for frame in 0..soak.frames {
        if soak.reset_every.is_some_and(|n| frame > 0 && frame % n == 0) {
            info!(frame, "Simulating device loss");
            ctx.simulate_device_lost();
        }

        let expected: Vec<Vec<u8>> = (0..BUFFER_COUNT).map(|i| pattern(frame, i)).collect();

        let generation = ctx.device().generation();
        let done = ctx.begin_frame()?.next_fence_value();
        let uploads = expected
            .iter()
            .map(|bytes| {
                let range = ctx.upload_allocator().alloc_buffer(BUFFER_SIZE, &done)?;
                range.cpu_write(0, bytes)?;
                Ok(range)
            })
            .collect::<dist_gpu::core::Result<Vec<_>>>()?;

        if let Some(commands) = ctx.frame_commands() {
            commands.begin_event("soak");
            for ((source, target), upload) in sources.iter().zip(&targets).zip(&uploads) {
                commands.update_buffer(source, 0, upload, BUFFER_SIZE);
                commands.copy_buffer(target, 0, source, 0, BUFFER_SIZE);
            }
            commands.end_event();
        }

        if !ctx.frame_complete() {
            bail!("device reset failed at frame {}", frame);
        }

        // 设备重置丢弃了这一帧的提交，下一帧重新上传
        if ctx.device().generation() != generation {
            info!(frame, generation = ctx.device().generation(), "Frame discarded by device reset");
            continue;
        }

        for (i, target) in targets.iter().enumerate() {
            let bytes = target.capture_buffer(&ctx, None, 0, BUFFER_SIZE)?;
            if bytes != expected[i] {
                bail!("frame {}: target {} content mismatch", frame, i);
            }
        }

        let info = ctx.device().memory_info();
        info!(frame, usage = info.current_usage, budget = info.budget, "Frame verified");
    }

    ctx.trim_device()?;
    info!(frames = soak.frames, generation = ctx.device().generation(), "Soak test finished");
    Ok(())
}

fn main() {
    let mut config = Config::from_file_or_default("config.toml");
    let args: Vec<String> = std::env::args().collect();
    config.apply_args(&args);

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let log_file = config.logging.file_output.then(|| config.logging.log_file.clone());
    log::init_logger(config.logging.level, config.logging.file_output, log_file.as_deref());
    info!(version = env!("CARGO_PKG_VERSION"), backend = ?config.device.backend, "DistGpu soak starting");

    let soak = match SoakArgs::parse(&args) {
        Ok(soak) => soak,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(config, soak) {
        error!(error = %format!("{:#}", e), "Soak test failed");
        eprintln!("Soak test failed: {:#}", e);
        std::process::exit(1);
    }
}
