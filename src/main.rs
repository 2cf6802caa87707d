use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use framewise::assets::{FRAME_HEIGHT, FRAME_RATE, FRAME_WIDTH, TARGET_OS};
use framewise::capture::{CaptureWorker, LatestFrame, SyntheticSource};
use framewise::config::{app_name, version};
use framewise::pipeline::{Frame, FrameShape, Postprocessor, Processor, ResultMap, Stage};
use framewise::resources::{ElementType, ResourcePool};
use framewise::safety::{Gated, SafetyInput};
use framewise::telemetry::{Category, SysinfoMetrics, Telemetry};
use framewise::utils::perf::ScopedTimer;
use framewise::utils::sos::SignalOfStop;
use framewise::{Engine, EngineConfig};
use log::{debug, error, info, warn};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use std::{process, thread};

fn main() {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON engine configuration, missing fields keep their defaults.")
                .required(false),
        )
        .arg(
            Arg::new("fps")
                .long("fps")
                .value_name("FPS")
                .help("Capture rate of the synthetic source.")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("PIXELS")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("PIXELS")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("SECONDS")
                .help("Exit after this many seconds instead of waiting for 'q' or Ctrl-C.")
                .value_parser(value_parser!(u64))
                .required(false),
        )
        .arg(
            Arg::new("auto-enable")
                .short('a')
                .long("auto-enable")
                .help("Enable processing right away instead of waiting for 't'.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-interval")
                .long("stats-interval")
                .value_name("MILLIS")
                .help("Overrides the telemetry report interval.")
                .value_parser(value_parser!(u64))
                .required(false),
        )
        .get_matches();

    if let Err(e) = run(&matches) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> Result<()> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(ms) = matches.get_one::<u64>("stats-interval") {
        config.engine.stats_interval_ms = *ms;
    }

    let fps = matches.get_one::<u32>("fps").copied().unwrap_or(FRAME_RATE);
    let shape = FrameShape::new(
        matches.get_one::<u32>("width").copied().unwrap_or(FRAME_WIDTH),
        matches.get_one::<u32>("height").copied().unwrap_or(FRAME_HEIGHT),
        3,
    );

    info!("{} v{} on {}", app_name(), version(), TARGET_OS);

    let builder = Engine::builder(config, Arc::new(SysinfoMetrics::new()));
    let probe = MotionProbe {
        telemetry: builder.telemetry(),
        resources: builder.resources(),
    };
    let actuator = Gated::new(builder.safety(), MotionAlarm { threshold: 8.0 });

    let engine = builder
        .stage(Stage::preprocess("grayscale", grayscale))
        .stage(Stage::Process(Box::new(probe)))
        .stage(Stage::Postprocess(Box::new(actuator)))
        .on_result(|processed| {
            debug!(
                "frame {} done in {:?}: {:?}",
                processed.frame.sequence, processed.latency, processed.results
            );
        })
        .build()?;

    let exit = SignalOfStop::new();

    // gracefully close the engine when receiving SIGINT, SIGTERM, or SIGHUP
    let on_signal = exit.clone();
    ctrlc::set_handler(move || on_signal.cancel())?;

    if let Some(seconds) = matches.get_one::<u64>("duration").copied() {
        let deadline = exit.clone();
        thread::spawn(move || {
            if !deadline.wait_timeout(Duration::from_secs(seconds)) {
                info!("Run duration elapsed");
                deadline.cancel();
            }
        });
    }

    let (input_tx, input_rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match line.parse::<SafetyInput>() {
                Ok(input) => {
                    if input_tx.send(input).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("{}", e),
            }
        }
    });
    engine.listen_for_inputs(input_rx, exit.clone());

    let slot = Arc::new(LatestFrame::new());
    let capture = CaptureWorker::new(SyntheticSource::new(shape), slot.clone(), fps);
    engine.spawn_worker("capture", Arc::new(capture));

    if matches.get_flag("auto-enable") {
        engine.safety().toggle();
    }
    info!("Controls: t = toggle, e = emergency stop, r = reset, q = quit");

    engine.run(slot.as_ref(), &exit)?;

    println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
    println!("{}", engine.pipeline().health().summary());
    Ok(())
}

/// Collapses every pixel to its channel mean, keeping the frame layout.
fn grayscale(frame: Frame) -> Result<Frame> {
    let channels = frame.shape.channels as usize;
    Ok(frame.map_pixels(|data| {
        for pixel in data.chunks_exact_mut(channels) {
            let mean = pixel.iter().map(|&b| b as u32).sum::<u32>() / channels as u32;
            pixel.fill(mean as u8);
        }
    }))
}

/// Mean brightness and mean absolute change against the previous frame.
struct MotionProbe {
    telemetry: Arc<Telemetry>,
    resources: Arc<ResourcePool>,
}

impl Processor for MotionProbe {
    fn name(&self) -> &str {
        "motion"
    }

    fn extract(&self, frame: &Frame, _results: &ResultMap) -> Result<ResultMap> {
        let _timer = ScopedTimer::new(&self.telemetry, Category::Detection);
        let shape = [
            frame.shape.height as usize,
            frame.shape.width as usize,
            frame.shape.channels as usize,
        ];
        let previous = self
            .resources
            .acquire_buffer("previous-frame", &shape, ElementType::U8)?;

        let (brightness, motion) = previous.with_data(|prev| {
            let mut sum = 0u64;
            let mut delta = 0u64;
            for (old, &new) in prev.iter_mut().zip(frame.data.iter()) {
                sum += new as u64;
                delta += old.abs_diff(new) as u64;
                *old = new;
            }
            let n = frame.size().max(1) as f64;
            (sum as f64 / n, delta as f64 / n)
        });

        let mut out = ResultMap::new();
        out.insert("brightness".into(), brightness.into());
        out.insert("motion".into(), motion.into());
        out.insert(
            "accelerated".into(),
            self.resources.should_prefer_accelerated_path().into(),
        );
        Ok(out)
    }
}

struct MotionAlarm {
    threshold: f64,
}

impl Postprocessor for MotionAlarm {
    fn name(&self) -> &str {
        "alarm"
    }

    fn act(&self, frame: &Frame, results: &ResultMap) -> Result<()> {
        let motion = results
            .get("motion")
            .and_then(|v| v.as_f64())
            .unwrap_or_default();
        if motion > self.threshold {
            info!("Motion {:.1} on frame {}", motion, frame.sequence);
        }
        Ok(())
    }
}
