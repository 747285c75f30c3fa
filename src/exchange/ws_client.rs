//! Reconnecting WebSocket client used by all exchange streams
//!
//! One spawned task owns the socket. On every (re)connect it sends the
//! listener's subscription frames, then pumps inbound text frames to the
//! listener. Outbound frames arrive over a command channel. A heartbeat
//! watchdog forces a reconnect when the server goes silent.

use super::backoff_delay;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Receives stream traffic and lifecycle callbacks
pub trait WsListener: Send + Sync + 'static {
    fn on_message(&self, text: &str);

    /// Frames sent after every successful connect
    fn subscription_frames(&self) -> Vec<String> {
        Vec::new()
    }

    fn on_connected(&self) {}
    fn on_disconnected(&self, _reason: &str) {}
    fn on_error(&self, _error: &str) {}
    fn on_pong(&self) {}

    /// Minimum wait before the next reconnect attempt
    fn reconnect_hold(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub name: String,
    pub url: String,
    pub connect_timeout: Duration,
    /// No inbound traffic for this long forces a reconnect
    pub heartbeat_timeout: Duration,
    /// Client ping period, if the venue expects pings
    pub ping_interval: Option<Duration>,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl WsConfig {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            connect_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            ping_interval: None,
            reconnect_delay: Duration::from_secs(2),
            max_reconnect_attempts: 3,
        }
    }
}

/// Connection counters shared between the task and its handle
#[derive(Debug, Default)]
pub struct WsStats {
    connected: AtomicBool,
    running: AtomicBool,
    messages_received: AtomicU64,
    reconnects: AtomicU64,
    consecutive_failures: AtomicU32,
    last_activity_ms: AtomicI64,
}

impl WsStats {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_activity_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

enum WsCommand {
    Send(String),
    Shutdown,
}

enum Exit {
    Shutdown,
    Disconnected(String),
}

/// Handle to a running stream task
pub struct WsHandle {
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    stats: Arc<WsStats>,
    task: JoinHandle<()>,
}

impl WsHandle {
    /// Queue a text frame. Frames sent while disconnected are dropped;
    /// subscriptions are replayed from the listener on reconnect.
    pub fn send(&self, frame: String) -> bool {
        self.cmd_tx.send(WsCommand::Send(frame)).is_ok()
    }

    pub fn stats(&self) -> &Arc<WsStats> {
        &self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.send(WsCommand::Shutdown);
    }
}

impl Drop for WsHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Shutdown);
    }
}

/// Spawn the stream task
pub fn spawn<L: WsListener>(config: WsConfig, listener: Arc<L>) -> WsHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let stats = Arc::new(WsStats::default());
    let task = tokio::spawn(run(config, listener, Arc::clone(&stats), cmd_rx));
    WsHandle { cmd_tx, stats, task }
}

async fn run<L: WsListener>(
    config: WsConfig,
    listener: Arc<L>,
    stats: Arc<WsStats>,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
) {
    stats.running.store(true, Ordering::SeqCst);
    let mut failures: u32 = 0;

    loop {
        match run_connection(&config, listener.as_ref(), &stats, &mut cmd_rx).await {
            Ok(Exit::Shutdown) => break,
            Ok(Exit::Disconnected(reason)) => {
                // A session was established, so the failure streak resets
                failures = 1;
                warn!("[{}] stream disconnected: {}", config.name, reason);
                listener.on_disconnected(&reason);
            }
            Err(e) => {
                failures += 1;
                error!("[{}] stream error: {}", config.name, e);
                listener.on_error(&e);
            }
        }
        stats.connected.store(false, Ordering::SeqCst);
        stats.consecutive_failures.store(failures, Ordering::Relaxed);

        if failures > config.max_reconnect_attempts {
            error!(
                "[{}] giving up after {} failed reconnect attempts",
                config.name, config.max_reconnect_attempts
            );
            break;
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        let mut delay = backoff_delay(config.reconnect_delay, failures, jitter);
        if let Some(hold) = listener.reconnect_hold() {
            delay = delay.max(hold);
        }
        info!("[{}] reconnecting in {:.1}s (attempt {})", config.name, delay.as_secs_f64(), failures);

        // Shutdown must still be honoured while waiting to reconnect
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let shutdown = loop {
            tokio::select! {
                _ = &mut sleep => break false,
                cmd = cmd_rx.recv() => match cmd {
                    Some(WsCommand::Shutdown) | None => break true,
                    Some(WsCommand::Send(_)) => debug!("[{}] dropping frame while disconnected", config.name),
                },
            }
        };
        if shutdown {
            break;
        }
        stats.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    stats.running.store(false, Ordering::SeqCst);
    stats.connected.store(false, Ordering::SeqCst);
    info!("[{}] stream task stopped", config.name);
}

async fn run_connection<L: WsListener>(
    config: &WsConfig,
    listener: &L,
    stats: &Arc<WsStats>,
    cmd_rx: &mut mpsc::UnboundedReceiver<WsCommand>,
) -> Result<Exit, String> {
    let connect = tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str()));
    let (ws_stream, _) = match connect.await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(format!("connect failed: {}", e)),
        Err(_) => return Err(format!("connect timed out after {:?}", config.connect_timeout)),
    };
    let (mut write, mut read) = ws_stream.split();

    stats.connected.store(true, Ordering::SeqCst);
    stats.consecutive_failures.store(0, Ordering::Relaxed);
    stats.touch();
    info!("[{}] stream connected to {}", config.name, config.url);
    listener.on_connected();

    for frame in listener.subscription_frames() {
        write
            .send(Message::Text(frame))
            .await
            .map_err(|e| format!("subscribe failed: {}", e))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let check_every = (config.heartbeat_timeout / 6).max(Duration::from_secs(1));
    let mut watchdog = tokio::time::interval(check_every);
    let mut pinger = tokio::time::interval(config.ping_interval.unwrap_or(Duration::from_secs(3600)));
    // First tick of an interval completes immediately
    watchdog.tick().await;
    pinger.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        stats.touch();
                        stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        listener.on_message(&text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        stats.touch();
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        stats.touch();
                        listener.on_pong();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        return Ok(Exit::Disconnected(format!("closed by server {}", reason)));
                    }
                    Some(Ok(_)) => stats.touch(),
                    Some(Err(e)) => return Err(e.to_string()),
                    None => return Ok(Exit::Disconnected("stream ended".to_string())),
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(WsCommand::Send(frame)) => {
                        if let Err(e) = write.send(Message::Text(frame)).await {
                            return Err(format!("send failed: {}", e));
                        }
                    }
                    Some(WsCommand::Shutdown) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(Exit::Shutdown);
                    }
                }
            }
            _ = watchdog.tick() => {
                let silent_ms = Utc::now().timestamp_millis() - stats.last_activity_ms();
                if silent_ms > config.heartbeat_timeout.as_millis() as i64 {
                    return Err(format!("no traffic for {}ms", silent_ms));
                }
            }
            _ = pinger.tick(), if config.ping_interval.is_some() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    return Err(format!("ping failed: {}", e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct Recorder {
        errors: Mutex<Vec<String>>,
        connects: AtomicUsize,
        frames: Vec<String>,
        hold: Option<Duration>,
    }

    impl WsListener for Recorder {
        fn on_message(&self, _text: &str) {}

        fn subscription_frames(&self) -> Vec<String> {
            self.frames.clone()
        }

        fn on_connected(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_error(&self, error: &str) {
            self.errors.lock().push(error.to_string());
        }

        fn reconnect_hold(&self) -> Option<Duration> {
            self.hold
        }
    }

    async fn local_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    fn fast_config(url: &str) -> WsConfig {
        let mut config = WsConfig::new("test", url);
        config.reconnect_delay = Duration::from_millis(1);
        config.connect_timeout = Duration::from_secs(2);
        config
    }

    async fn wait_until(what: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(15), async {
            while !what() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_subscriptions_replayed_and_failures_reset_per_session() {
        let (server, url) = local_server().await;
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&received);
        tokio::spawn(async move {
            // Each session takes the subscription frame, then the server hangs up
            loop {
                let (tcp, _) = server.accept().await.unwrap();
                let mut ws = accept_async(tcp).await.unwrap();
                if let Some(Ok(Message::Text(frame))) = ws.next().await {
                    seen.lock().push(frame);
                }
                let _ = ws.close(None).await;
            }
        });

        let mut config = fast_config(&url);
        config.max_reconnect_attempts = 1;
        let listener = Arc::new(Recorder {
            frames: vec!["subscribe:ETHUSDT".to_string()],
            ..Recorder::default()
        });
        let handle = spawn(config, Arc::clone(&listener));

        // Three sessions with max_reconnect_attempts = 1 means the streak reset
        wait_until(|| received.lock().len() >= 3).await;
        assert!(received.lock().iter().all(|f| f == "subscribe:ETHUSDT"));
        assert!(listener.connects.load(Ordering::SeqCst) >= 3);
        assert!(handle.stats().is_running());
        assert!(handle.stats().consecutive_failures() <= 1);
        assert!(handle.stats().reconnects() >= 2);
        handle.close();
    }

    #[tokio::test]
    async fn test_answers_server_ping() {
        let (server, url) = local_server().await;
        let (pong_tx, pong_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (tcp, _) = server.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Ping(vec![7, 8, 9])).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Pong(data) = msg {
                    let _ = pong_tx.send(data);
                    break;
                }
            }
            // Keep the session open until the client leaves
            while ws.next().await.is_some() {}
        });

        let handle = spawn(fast_config(&url), Arc::new(Recorder::default()));
        let data = tokio::time::timeout(Duration::from_secs(10), pong_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, vec![7, 8, 9]);
        assert!(handle.stats().is_connected());
        handle.close();
    }

    #[tokio::test]
    async fn test_silent_server_triggers_reconnect() {
        let (server, url) = local_server().await;
        let sessions = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&sessions);
        tokio::spawn(async move {
            // Accept and never send anything; sockets stay open
            let mut open = Vec::new();
            loop {
                let (tcp, _) = server.accept().await.unwrap();
                open.push(accept_async(tcp).await.unwrap());
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        let mut config = fast_config(&url);
        config.heartbeat_timeout = Duration::from_millis(500);
        let listener = Arc::new(Recorder::default());
        let handle = spawn(config, Arc::clone(&listener));

        wait_until(|| sessions.load(Ordering::SeqCst) >= 2).await;
        assert!(listener.errors.lock()[0].starts_with("no traffic"));
        assert!(handle.stats().reconnects() >= 1);
        handle.close();
    }

    #[tokio::test]
    async fn test_reconnect_hold_delays_next_attempt() {
        let mut config = WsConfig::new("test", "ws://127.0.0.1:1/ws");
        config.reconnect_delay = Duration::from_millis(1);
        config.connect_timeout = Duration::from_millis(500);
        let listener = Arc::new(Recorder {
            hold: Some(Duration::from_secs(30)),
            ..Recorder::default()
        });
        let handle = spawn(config, Arc::clone(&listener));

        wait_until(|| listener.errors.lock().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(listener.errors.lock().len(), 1);
        assert_eq!(handle.stats().reconnects(), 0);
        assert!(handle.stats().is_running());

        handle.close();
        wait_until(|| handle.is_finished()).await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut config = WsConfig::new("test", "ws://127.0.0.1:1/ws");
        config.reconnect_delay = Duration::from_millis(1);
        config.connect_timeout = Duration::from_millis(500);
        config.max_reconnect_attempts = 1;

        let listener = Arc::new(Recorder::default());
        let handle = spawn(config, Arc::clone(&listener));

        tokio::time::timeout(Duration::from_secs(10), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(listener.errors.lock().len(), 2);
        assert!(!handle.stats().is_connected());
        assert!(!handle.stats().is_running());
        assert_eq!(handle.stats().reconnects(), 1);
    }

    #[tokio::test]
    async fn test_close_stops_task() {
        let mut config = WsConfig::new("test", "ws://127.0.0.1:1/ws");
        config.reconnect_delay = Duration::from_secs(5);
        config.connect_timeout = Duration::from_millis(500);

        let handle = spawn(config, Arc::new(Recorder::default()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.close();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(!handle.stats().is_running());
    }
}
