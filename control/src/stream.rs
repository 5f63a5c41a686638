use std::time::Duration;

use axum::body::{Body, Bytes};
use futures::stream;
use tokio::sync::watch;

use netrunner_network::cluster::ClusterInfo;

/// Floor for caller-chosen push intervals.
const MIN_PUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Newline-delimited JSON stream of the most recent `ClusterInfo`, pushed at
/// the caller's interval. Each subscriber reads the watch channel, which
/// coalesces intermediate frames; the stream ends when the client hangs up.
pub fn status_stream(rx: watch::Receiver<ClusterInfo>, push_interval: Duration) -> Body {
    let interval = tokio::time::interval(push_interval.max(MIN_PUSH_INTERVAL));
    let frames = stream::unfold((rx, interval), |(rx, mut interval)| async move {
        interval.tick().await;
        let frame = {
            let info = rx.borrow();
            let mut line = serde_json::to_vec(&*info).unwrap_or_default();
            line.push(b'\n');
            Bytes::from(line)
        };
        Some((Ok::<_, std::io::Error>(frame), (rx, interval)))
    });
    Body::from_stream(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stream_yields_latest_frame() {
        let (tx, rx) = watch::channel(ClusterInfo::default());
        let mut info = ClusterInfo::default();
        info.network_id = 1337;
        tx.send(info).unwrap();

        let body = status_stream(rx, Duration::from_millis(100));
        let mut data = body.into_data_stream();
        let first = data.next().await.unwrap().unwrap();
        let parsed: ClusterInfo = serde_json::from_slice(&first).unwrap();
        assert_eq!(parsed.network_id, 1337);
    }
}
