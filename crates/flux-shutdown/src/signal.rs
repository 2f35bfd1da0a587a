use std::io;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Term,

    /// SIGINT - Ctrl+C
    Interrupt,

    /// 手动触发
    Manual,

    /// 所有被监督的工作单元都已自行结束
    Completed,
}

/// 信号处理器
///
/// 系统信号与程序内部触发的关闭请求走同一个广播通道。
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
}

impl SignalHandler {
    pub fn new() -> (Self, broadcast::Receiver<ShutdownSignal>) {
        let (tx, rx) = broadcast::channel(16);
        (Self { shutdown_tx: tx }, rx)
    }

    /// 等待广播通道上的关闭请求
    pub async fn wait_for_signal(&self) -> ShutdownSignal {
        let mut rx = self.shutdown_tx.subscribe();
        rx.recv().await.unwrap_or(ShutdownSignal::Manual)
    }

    /// 等待 SIGTERM / SIGINT
    #[cfg(unix)]
    pub async fn wait_for_system_signal(&self) -> io::Result<ShutdownSignal> {
        use signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let received = tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                ShutdownSignal::Term
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                ShutdownSignal::Interrupt
            }
        };

        let _ = self.shutdown_tx.send(received);
        Ok(received)
    }

    /// 等待 Ctrl+C（非 unix 平台）
    #[cfg(not(unix))]
    pub async fn wait_for_system_signal(&self) -> io::Result<ShutdownSignal> {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C");
        let _ = self.shutdown_tx.send(ShutdownSignal::Interrupt);
        Ok(ShutdownSignal::Interrupt)
    }

    /// 等待系统信号或程序内部触发，以先到者为准
    ///
    /// 无法安装信号处理时只等待内部触发。
    pub async fn wait(&self) -> ShutdownSignal {
        let mut rx = self.shutdown_tx.subscribe();

        tokio::select! {
            system = self.wait_for_system_signal() => match system {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "Failed to install signal handlers, waiting for manual trigger");
                    rx.recv().await.unwrap_or(ShutdownSignal::Manual)
                }
            },
            triggered = rx.recv() => triggered.unwrap_or(ShutdownSignal::Manual),
        }
    }

    /// 触发关闭
    pub fn trigger(&self, signal: ShutdownSignal) {
        info!(signal = ?signal, "Shutdown triggered");
        let _ = self.shutdown_tx.send(signal);
    }

    /// 手动触发关闭
    pub fn trigger_shutdown(&self) {
        self.trigger(ShutdownSignal::Manual);
    }

    /// 订阅关闭信号
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new().0
    }
}
