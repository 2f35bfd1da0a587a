//! `flux-camerad pipeline`：进程后端启动的回放管道
//!
//! stdout 只写协议消息，日志走 stderr。

use anyhow::{Context, Result};
use clap::Args;
use flux_camera::pipeline::replay::frame_interval;
use flux_camera::{ControlMessage, PipelineMessage, RecordedFrame, ReplaySource};
use flux_occupancy::LineConfig;
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// 相机 ID
    #[arg(long)]
    pub camera_id: u32,

    /// 录制的跟踪结果文件（JSONL）
    #[arg(long)]
    pub source: String,

    /// 计数线配置（JSON）
    #[arg(long)]
    pub line: Option<String>,

    /// 回放帧率（0 = 不限速）
    #[arg(long, default_value_t = 25.0)]
    pub fps: f64,
}

pub fn run(args: PipelineArgs) -> Result<()> {
    if let Some(raw) = &args.line {
        match LineConfig::from_json(raw) {
            Ok(line) => debug!(camera_id = args.camera_id, line = ?line, "Line configuration received"),
            Err(e) => warn!(camera_id = args.camera_id, error = %e, "Ignoring unparsable line configuration"),
        }
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();

    let source = match ReplaySource::open(&args.source) {
        Ok(source) => source,
        Err(e) => {
            error!(camera_id = args.camera_id, error = %e, "Failed to open source");
            send(&mut out, &PipelineMessage::Error { message: e.message.clone() })?;
            return Err(e).context("pipeline failed to start");
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    watch_stdin(stop.clone());

    send(&mut out, &PipelineMessage::Started)?;
    info!(camera_id = args.camera_id, source = %args.source, "Replay pipeline started");

    match replay(source, &mut out, &stop, frame_interval(args.fps)) {
        Ok(frames) => {
            info!(camera_id = args.camera_id, frames, "Replay pipeline finished");
            send(&mut out, &PipelineMessage::Finished)?;
            Ok(())
        }
        Err(e) => {
            error!(camera_id = args.camera_id, error = %e, "Replay pipeline failed");
            send(&mut out, &PipelineMessage::Error { message: e.to_string() })?;
            Err(e)
        }
    }
}

/// 把录制的帧按间隔写出，收到停止请求或读到结尾时返回已写出的帧数
pub fn replay<I, W>(frames: I, out: &mut W, stop: &AtomicBool, interval: Duration) -> Result<u64>
where
    I: IntoIterator<Item = Result<RecordedFrame, flux_camera::PipelineFailure>>,
    W: Write,
{
    let mut sent = 0u64;

    for frame in frames {
        if stop.load(Ordering::SeqCst) {
            debug!("Stop requested");
            break;
        }

        let frame = frame?;
        send(
            out,
            &PipelineMessage::Frame {
                objects: frame.objects,
            },
        )?;
        sent += 1;

        if !sleep_unless_stopped(stop, interval) {
            break;
        }
    }

    Ok(sent)
}

fn send<W: Write>(out: &mut W, message: &PipelineMessage) -> Result<()> {
    out.write_all(message.to_line()?.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10).min(deadline - now));
    }
}

/// stdin 收到 `stop` 或被关闭时置位停止标志
fn watch_stdin(stop: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("pipeline-control".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                match ControlMessage::parse(&line) {
                    Ok(ControlMessage::Stop) => {
                        debug!("Received stop command");
                        break;
                    }
                    Err(_) => debug!(line = %line, "Ignoring unknown control input"),
                }
            }
            stop.store(true, Ordering::SeqCst);
        });

    if let Err(e) = spawned {
        warn!(error = %e, "Failed to spawn control thread, stop requests will be ignored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_replay_writes_frames() {
        let data = "{\"objects\":[{\"id\":7,\"x\":50,\"y\":-5}]}\n{\"objects\":[{\"id\":7,\"x\":50,\"y\":5}]}\n";
        let mut out = Vec::new();
        let stop = AtomicBool::new(false);

        let sent = replay(
            ReplaySource::new(Cursor::new(data)),
            &mut out,
            &stop,
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(sent, 2);

        let text = String::from_utf8(out).unwrap();
        let messages: Vec<_> = text
            .lines()
            .map(|line| PipelineMessage::parse(line).unwrap())
            .collect();
        assert_eq!(messages.len(), 2);
        match &messages[1] {
            PipelineMessage::Frame { objects } => assert_eq!(objects[0].y, 5.0),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_replay_honours_stop() {
        let data = "{\"objects\":[]}\n{\"objects\":[]}\n";
        let mut out = Vec::new();
        let stop = AtomicBool::new(true);

        let sent = replay(
            ReplaySource::new(Cursor::new(data)),
            &mut out,
            &stop,
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(sent, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_replay_surfaces_bad_frames() {
        let data = "{\"objects\":[]}\n{broken\n";
        let mut out = Vec::new();
        let stop = AtomicBool::new(false);

        let result = replay(
            ReplaySource::new(Cursor::new(data)),
            &mut out,
            &stop,
            Duration::ZERO,
        );
        assert!(result.is_err());
    }
}
