use serde::Deserialize;

/// `mm-link` queue kind implementing stochastic fair queueing.
pub const SFQ_QUEUE: &str = "akshayfq";
/// Number of hash buckets used in stochastic fairness mode.
pub const SFQ_QUEUES: u32 = 500;
/// `mm-link` queue kind for multi-queue ECMP emulation.
pub const ECMP_QUEUE: &str = "ecmp";
pub const DROPTAIL_QUEUE: &str = "droptail";

/// Queue used on one direction of the link when no fairness mode applies.
///
/// Without explicit `args`, the queue is sized to the computed buffer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FifoQueue {
    pub queue: String,
    #[serde(default)]
    pub args: Option<String>,
}

impl Default for FifoQueue {
    fn default() -> Self {
        Self {
            queue: DROPTAIL_QUEUE.to_string(),
            args: None,
        }
    }
}

impl FifoQueue {
    fn resolved_args(&self, buffer_pkts: u64) -> String {
        self.args
            .clone()
            .unwrap_or_else(|| format!("packets={buffer_pkts}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct EcmpConfig {
    pub queues: u32,
    pub mean_jitter: u32,
    #[serde(default)]
    pub nonworkconserving: bool,
}

/// Queueing applied by the emulated link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueDiscipline {
    /// Configured per-direction queues (drop-tail unless overridden).
    Fifo { downlink: FifoQueue, uplink: FifoQueue },
    /// Downlink split over several jittered queues.
    Ecmp(EcmpConfig),
    /// Fixed 500-bucket fair queue on the downlink.
    Sfq,
}

impl Default for QueueDiscipline {
    fn default() -> Self {
        QueueDiscipline::Fifo {
            downlink: FifoQueue::default(),
            uplink: FifoQueue::default(),
        }
    }
}

impl QueueDiscipline {
    /// `mm-link` queue flags for a buffer of `buffer_pkts` packets.
    ///
    /// An unbounded buffer (`None`) emits no flags, leaving the emulator's
    /// default queue in place.
    pub fn link_args(&self, buffer_pkts: Option<u64>) -> Vec<String> {
        let Some(buf) = buffer_pkts else {
            return Vec::new();
        };

        let (down, down_args, up, up_args) = match self {
            QueueDiscipline::Ecmp(ecmp) => (
                ECMP_QUEUE.to_string(),
                format!(
                    "packets={buf},queues={},mean_jitter={},nonworkconserving={}",
                    ecmp.queues,
                    ecmp.mean_jitter,
                    u8::from(ecmp.nonworkconserving)
                ),
                DROPTAIL_QUEUE.to_string(),
                format!("packets={buf}"),
            ),
            QueueDiscipline::Sfq => (
                SFQ_QUEUE.to_string(),
                format!("queues={SFQ_QUEUES},packets={buf}"),
                DROPTAIL_QUEUE.to_string(),
                format!("packets={buf}"),
            ),
            QueueDiscipline::Fifo { downlink, uplink } => (
                downlink.queue.clone(),
                downlink.resolved_args(buf),
                uplink.queue.clone(),
                uplink.resolved_args(buf),
            ),
        };

        vec![
            format!("--downlink-queue={down}"),
            format!("--uplink-queue={up}"),
            format!("--downlink-queue-args={down_args}"),
            format!("--uplink-queue-args={up_args}"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_fifo_sizes_both_directions() {
        let args = QueueDiscipline::default().link_args(Some(800));
        assert_eq!(
            args,
            vec![
                "--downlink-queue=droptail",
                "--uplink-queue=droptail",
                "--downlink-queue-args=packets=800",
                "--uplink-queue-args=packets=800",
            ]
        );
    }

    #[test]
    fn explicit_fifo_args_override_computed_size() {
        let q = QueueDiscipline::Fifo {
            downlink: FifoQueue {
                queue: "codel".into(),
                args: Some("target=5,interval=100".into()),
            },
            uplink: FifoQueue::default(),
        };
        let args = q.link_args(Some(120));
        assert!(args.contains(&"--downlink-queue=codel".to_string()));
        assert!(args.contains(&"--downlink-queue-args=target=5,interval=100".to_string()));
        assert!(args.contains(&"--uplink-queue-args=packets=120".to_string()));
    }

    #[test]
    fn ecmp_carries_queue_count_and_jitter() {
        let q = QueueDiscipline::Ecmp(EcmpConfig {
            queues: 4,
            mean_jitter: 3,
            nonworkconserving: true,
        });
        let args = q.link_args(Some(400));
        assert_eq!(args[0], "--downlink-queue=ecmp");
        assert_eq!(
            args[2],
            "--downlink-queue-args=packets=400,queues=4,mean_jitter=3,nonworkconserving=1"
        );
        assert_eq!(args[3], "--uplink-queue-args=packets=400");
    }

    #[test]
    fn sfq_uses_fixed_bucket_count() {
        let args = QueueDiscipline::Sfq.link_args(Some(50));
        assert_eq!(args[0], "--downlink-queue=akshayfq");
        assert_eq!(args[2], "--downlink-queue-args=queues=500,packets=50");
    }

    #[test]
    fn unbounded_buffer_emits_nothing() {
        assert!(QueueDiscipline::Sfq.link_args(None).is_empty());
        assert!(QueueDiscipline::default().link_args(None).is_empty());
    }
}
