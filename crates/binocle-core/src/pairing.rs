//! Continuous pairing of the two analysis streams.
//!
//! Each sensor's analysis sink feeds a conflated mailbox. The pairing task
//! takes the latest primary frame, then (in dual-sensor mode) the latest
//! secondary frame, and forwards the pair. Pairs are "next available from
//! each", not timestamp-matched. An analysis thread consumes the pairs.

use crate::analysis::{AnalysisError, Analyzer};
use crate::mailbox::{conflated, MailboxReceiver};
use binocle_hw::{Frame, FrameSink};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One primary frame and, in dual-sensor mode, its secondary partner.
#[derive(Debug)]
pub struct FramePair {
    pub primary: Frame,
    pub secondary: Option<Frame>,
}

/// Result of analyzing one pair.
#[derive(Debug)]
pub struct AnalysisOutcome<T> {
    pub primary_sequence: u64,
    pub secondary_sequence: Option<u64>,
    pub result: Result<Vec<T>, AnalysisError>,
}

/// Route a sink's frames into a fresh conflated mailbox.
///
/// Frames already queued in the sink are released first. The mailbox
/// closes when the sink drops its listener (detach or close).
pub fn attach_mailbox(sink: &FrameSink) -> MailboxReceiver<Frame> {
    let stale = sink.flush();
    if stale > 0 {
        tracing::debug!(sink = %sink.name(), count = stale, "stale analysis frames released");
    }
    let (tx, rx) = conflated(sink.name());
    // On a closed sink the listener is dropped at once, closing the mailbox.
    sink.set_listener(Arc::new(move |frame: Frame| {
        tx.post(frame);
    }));
    rx
}

/// Pair frames until either stream closes or the consumer goes away.
///
/// A frame taken from the primary stream is dropped, not forwarded, if the
/// secondary stream closes before supplying its partner.
pub async fn run_pairing(
    mut primary: MailboxReceiver<Frame>,
    mut secondary: Option<MailboxReceiver<Frame>>,
    pairs: mpsc::Sender<FramePair>,
) {
    tracing::debug!(dual = secondary.is_some(), "pairing loop started");
    let mut emitted = 0u64;
    loop {
        let Some(primary_frame) = primary.recv().await else {
            break;
        };
        let secondary_frame = match secondary.as_mut() {
            Some(rx) => match rx.recv().await {
                Some(frame) => Some(frame),
                None => break,
            },
            None => None,
        };
        let pair = FramePair {
            primary: primary_frame,
            secondary: secondary_frame,
        };
        if pairs.send(pair).await.is_err() {
            break;
        }
        emitted += 1;
    }
    tracing::info!(
        emitted,
        primary_replaced = primary.replaced(),
        secondary_replaced = secondary.as_ref().map(|rx| rx.replaced()),
        "pairing loop stopped"
    );
}

/// Run `analyzer` over every pair on a dedicated OS thread.
///
/// Frames are released as soon as their pair has been analyzed. The thread
/// exits when the pair channel closes.
pub fn spawn_analysis_thread<A, F>(
    mut analyzer: A,
    mut pairs: mpsc::Receiver<FramePair>,
    mut on_outcome: F,
) -> std::io::Result<std::thread::JoinHandle<()>>
where
    A: Analyzer,
    F: FnMut(AnalysisOutcome<A::Output>) + Send + 'static,
{
    std::thread::Builder::new()
        .name("binocle-analysis".into())
        .spawn(move || {
            tracing::info!("analysis thread started");
            while let Some(pair) = pairs.blocking_recv() {
                let result = analyzer.analyze(&pair.primary, pair.secondary.as_ref());
                if let Err(e) = &result {
                    tracing::warn!(sequence = pair.primary.sequence(), error = %e, "analysis failed");
                }
                let outcome = AnalysisOutcome {
                    primary_sequence: pair.primary.sequence(),
                    secondary_sequence: pair.secondary.as_ref().map(Frame::sequence),
                    result,
                };
                drop(pair);
                on_outcome(outcome);
            }
            tracing::info!("analysis thread exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use binocle_hw::frame::{layout_extent, nv21_layout};
    use std::time::Duration;

    fn publish(sink: &FrameSink, sequence: u64) -> bool {
        let planes = nv21_layout(4, 4, 4);
        let bytes = vec![sequence as u8; layout_extent(&planes)];
        sink.publish(&bytes, &planes, sequence * 1_000, sequence)
    }

    #[tokio::test]
    async fn test_second_arrival_delivered_first_released() {
        let sink = FrameSink::new("cam0/analysis", 4, 4, 3);
        let rx = attach_mailbox(&sink);
        let (tx, mut pairs) = mpsc::channel(1);

        assert!(publish(&sink, 1));
        assert!(publish(&sink, 2));
        assert_eq!(sink.pool().released(), 1);
        assert_eq!(sink.pool().outstanding(), 1);

        let task = tokio::spawn(run_pairing(rx, None, tx));
        let pair = pairs.recv().await.unwrap();
        assert_eq!(pair.primary.sequence(), 2);
        assert!(pair.secondary.is_none());
        drop(pair);
        assert_eq!(sink.pool().outstanding(), 0);

        sink.close();
        task.await.unwrap();
        assert!(pairs.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dual_mode_always_pairs() {
        let primary = FrameSink::new("ir/analysis", 4, 4, 3);
        let secondary = FrameSink::new("rgb/analysis", 4, 4, 3);
        let (tx, mut pairs) = mpsc::channel(1);
        let task = tokio::spawn(run_pairing(
            attach_mailbox(&primary),
            Some(attach_mailbox(&secondary)),
            tx,
        ));

        publish(&primary, 10);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pairs.try_recv().is_err());

        publish(&secondary, 20);
        let pair = pairs.recv().await.unwrap();
        assert_eq!(pair.primary.sequence(), 10);
        assert_eq!(pair.secondary.as_ref().map(Frame::sequence), Some(20));

        drop(pair);
        primary.close();
        secondary.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_secondary_close_drops_partial_pair() {
        let primary = FrameSink::new("p", 4, 4, 3);
        let secondary = FrameSink::new("s", 4, 4, 3);
        let (tx, mut pairs) = mpsc::channel(1);
        let task = tokio::spawn(run_pairing(
            attach_mailbox(&primary),
            Some(attach_mailbox(&secondary)),
            tx,
        ));

        publish(&primary, 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        secondary.close();
        task.await.unwrap();

        assert!(pairs.recv().await.is_none());
        assert_eq!(primary.pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_analysis_thread_reports_and_releases() {
        use crate::analysis::FrameStatsAnalyzer;

        let sink = FrameSink::new("p", 4, 4, 3);
        let (tx, pairs) = mpsc::channel(1);
        let (out_tx, out_rx) = std::sync::mpsc::channel();
        let handle = spawn_analysis_thread(FrameStatsAnalyzer::default(), pairs, move |outcome| {
            let _ = out_tx.send(outcome);
        })
        .unwrap();

        publish(&sink, 5);
        let frame = sink.acquire_next().unwrap();
        tx.send(FramePair {
            primary: frame,
            secondary: None,
        })
        .await
        .unwrap();
        drop(tx);

        tokio::task::spawn_blocking(move || handle.join().unwrap())
            .await
            .unwrap();
        let outcome = out_rx.recv().unwrap();
        assert_eq!(outcome.primary_sequence, 5);
        assert_eq!(outcome.result.unwrap().len(), 1);
        assert_eq!(sink.pool().outstanding(), 0);
    }
}
