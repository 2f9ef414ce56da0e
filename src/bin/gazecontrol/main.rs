//! Sends the id of the marker the wearer dwells on to the actuator.

use clap::Parser;
use gazecontrol::{
    args::GazeArgs,
    calibration::{CalibrationSession, CalibrationState, HttpTransport},
    config::Settings,
    control_loop::{ControlLoop, FrameSource},
    detector::{FixedRegions, Marker},
    dummy_glasses::{simulated_fixations, DummyGlasses, TestPatternDecoder},
    dwell_filter::DwellFilter,
    eye_tracking::EyeTracking,
    ffmpeg_decoder::FfmpegDecoder,
    frame_channel::{FrameChannel, FrameShape},
    gui::{dashboard, device_selector, PortChoice},
    keepalive::{KeepAlive, StreamKind},
    output::{LineSink, LogSink, SerialSink},
    stream_sync::{ClockRatio, StreamSync},
};
use log::{info, warn};
use serial2::SerialPort;
use std::{
    error::Error,
    thread::sleep,
    time::{Duration, Instant},
};

// Example:
// cargo run --bin gazecontrol -- /dev/ttyUSB0 --headless --threshold 15
// cargo run --bin gazecontrol -- --simulate

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = GazeArgs::parse();

    let mut settings = Settings::load_or_default(args.config.as_deref())?;
    args.apply(&mut settings);

    // keep the simulated device alive for as long as the loop runs
    // the simulated telemetry and the test pattern share one clock
    let epoch = Instant::now();
    let mut simulator = None;
    if args.simulate {
        let glasses = DummyGlasses::with_clock("127.0.0.1:0".parse()?, 50.0, 0.005, epoch)?;
        settings.data_peer = glasses.local_addr();
        if settings.regions.is_empty() {
            settings.regions = fixation_regions(settings.frame_shape);
        }
        simulator = Some(glasses);
    }

    let Some(mut sink) = open_sink(&args, &settings)? else {
        info!("No port selected, exiting");
        return Ok(());
    };

    let mut calibration = None;
    if args.simulate {
        if args.calibrate {
            warn!("Simulated glasses cannot be calibrated, skipping");
        }
    } else {
        let mut session = CalibrationSession::new(HttpTransport::new(&settings.calibration_url));
        if args.calibrate {
            calibrate(&mut session, sink.as_mut())?;
        }
        calibration = Some(session);
    }

    let tracking = EyeTracking::start(settings.data_peer, settings.keepalive_interval())?;
    let video_keepalive = KeepAlive::subscribe(
        settings.data_peer,
        StreamKind::Video,
        settings.keepalive_interval(),
    )?;
    let frames = open_video(&args, &settings, epoch)?;

    let sync = StreamSync::new(ClockRatio::default(), settings.sync_limits());
    let dwell = DwellFilter::new(settings.dwell_window, settings.dwell_threshold);
    let mut control = ControlLoop::new(
        Box::new(tracking),
        frames,
        Box::new(FixedRegions::new(settings.regions.clone())),
        sink,
        sync,
        dwell,
    )
    .with_gaze_offset(settings.gaze_offset)
    .with_keepalive(video_keepalive);
    if let Some(session) = calibration {
        control = control.with_calibration(session);
    }

    if settings.headless {
        let stopper = control.stopper();
        ctrlc::set_handler(move || stopper.stop())?;

        let frames = control.run();
        info!("Processed {} frames", frames);
    } else {
        control = dashboard(control)?;
    }

    control.shutdown();
    if let Some(mut glasses) = simulator {
        glasses.stop();
    }
    Ok(())
}

/// The serial port from the command line, or one the user picks. `None`
/// means the user chose to quit.
fn open_sink(args: &GazeArgs, settings: &Settings) -> Result<Option<Box<dyn LineSink>>, Box<dyn Error>> {
    if let Some(port) = &args.port {
        return Ok(Some(Box::new(SerialSink::open(port, settings.serial_baud)?)));
    }
    if settings.headless {
        warn!("No serial port given, commands will only be logged");
        return Ok(Some(Box::new(LogSink)));
    }

    let sink: Box<dyn LineSink> = match device_selector(SerialPort::available_ports()?)? {
        PortChoice::Port(port) => Box::new(SerialSink::open(port, settings.serial_baud)?),
        PortChoice::LogOnly => Box::new(LogSink),
        PortChoice::Quit => return Ok(None),
    };
    Ok(Some(sink))
}

fn open_video(
    args: &GazeArgs,
    settings: &Settings,
    epoch: Instant,
) -> Result<Box<dyn FrameSource>, Box<dyn Error>> {
    let mut channel = if args.simulate {
        let decoder =
            TestPatternDecoder::new(settings.frame_shape, settings.frame_rate).with_epoch(epoch);
        FrameChannel::new(decoder, settings.frame_pool_size)
    } else {
        let decoder = FfmpegDecoder::spawn(
            &settings.video_uri,
            settings.frame_shape,
            settings.frame_rate,
        )?;
        FrameChannel::new(decoder, settings.frame_pool_size)
    };
    channel.start()?;
    Ok(Box::new(channel))
}

/// Calibrate and wait for the outcome, which is also sent to the actuator.
/// Anything but success stops the program.
fn calibrate(session: &mut CalibrationSession, sink: &mut dyn LineSink) -> Result<(), Box<dyn Error>> {
    session.start()?;
    let outcome = loop {
        if let Some(state) = session.update() {
            break state;
        }
        sleep(Duration::from_millis(500));
    };

    if let Some(code) = outcome.status_code() {
        sink.write_line(code)?;
    }
    match outcome {
        CalibrationState::Calibrated => Ok(()),
        state => Err(format!("calibration ended as {}", state).into()),
    }
}

/// One square target around each point the simulated wearer fixates.
fn fixation_regions(shape: FrameShape) -> Vec<Marker> {
    let half = shape.width.min(shape.height) as f32 * 0.05;
    simulated_fixations()
        .into_iter()
        .enumerate()
        .map(|(i, (x, y))| {
            let cx = x as f32 * shape.width as f32;
            let cy = y as f32 * shape.height as f32;
            Marker {
                id: i as i32,
                corners: vec![
                    (cx - half, cy - half),
                    (cx + half, cy - half),
                    (cx + half, cy + half),
                    (cx - half, cy + half),
                ],
            }
        })
        .collect()
}
