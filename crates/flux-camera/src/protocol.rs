//! 子进程分析管道的行协议
//!
//! 子进程往 stdout 写一行一个 JSON 的 [`PipelineMessage`]，
//! 从 stdin 读 [`ControlMessage`]。计数器始终留在父进程，跨进程边界的只有消息。

use flux_occupancy::ObjectSample;
use serde::{Deserialize, Serialize};

/// 管道 -> 监督进程
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineMessage {
    /// 管道初始化完成
    Started,
    /// 一帧的跟踪结果
    Frame {
        #[serde(default)]
        objects: Vec<ObjectSample>,
    },
    /// 管道内部错误
    Error { message: String },
    /// 管道自行结束（EOF/EOS）
    Finished,
}

/// 监督进程 -> 管道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlMessage {
    Stop,
}

impl PipelineMessage {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl ControlMessage {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(
            PipelineMessage::Started.to_line().unwrap(),
            "{\"event\":\"started\"}\n"
        );
        assert_eq!(
            ControlMessage::Stop.to_line().unwrap(),
            "{\"command\":\"stop\"}\n"
        );
    }

    #[test]
    fn test_parse_frame_from_external_pipeline() {
        let msg = PipelineMessage::parse(
            r#"{"event":"frame","objects":[{"id":7,"x":50,"y":-5},{"id":8,"x":1.0,"y":2.0,"person":false}]}"#,
        )
        .unwrap();

        match msg {
            PipelineMessage::Frame { objects } => {
                assert_eq!(objects.len(), 2);
                assert_eq!(objects[0].id, 7);
                assert!(objects[0].person);
                assert!(!objects[1].person);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_and_rejects_garbage() {
        assert_eq!(
            PipelineMessage::parse(r#"{"event":"error","message":"rtsp timeout"}"#).unwrap(),
            PipelineMessage::Error {
                message: "rtsp timeout".to_string()
            }
        );
        assert!(PipelineMessage::parse("GStreamer warning: something").is_err());
        assert!(ControlMessage::parse(r#"{"command":"pause"}"#).is_err());
    }
}
