/*!
 * Telemetry samples and their in-memory storage.
 *
 * Sessions decode unsolicited frames into [`TelemetrySample`]s and push them
 * into a shared [`RingBuffer`]; display consumers read it back through
 * snapshots and decimation without ever blocking the producer.
 */

mod ring_buffer;
mod sample;

pub use ring_buffer::{Iter, RingBuffer, Snapshot, MIN_CAPACITY};
pub use sample::{SampleValue, TelemetrySample};

/// Ring buffer specialised for decoded device telemetry
pub type TelemetryRingBuffer = RingBuffer<TelemetrySample>;

impl Snapshot<TelemetrySample> {
    /// Min/max decimation on the numeric projection of each sample
    pub fn decimate_samples(&self, target: usize) -> Vec<TelemetrySample> {
        self.decimate_min_max(target, |sample| sample.value.as_f64())
    }

    /// Samples of one channel, oldest first
    pub fn channel<'a>(&'a self, channel: &'a str) -> impl Iterator<Item = &'a TelemetrySample> + 'a {
        self.iter().filter(move |sample| sample.channel == channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_filter_and_sample_decimation() {
        let ring = TelemetryRingBuffer::new(0);
        for i in 0..50 {
            ring.push(TelemetrySample::now("adc0", i as f64));
            ring.push(TelemetrySample::now("relay1", i % 2 == 0));
        }

        let snapshot = ring.snapshot();
        assert_eq!(snapshot.channel("adc0").count(), 50);
        assert_eq!(snapshot.channel("relay1").count(), 50);
        assert_eq!(snapshot.channel("missing").count(), 0);

        let reduced = snapshot.decimate_samples(10);
        assert!(reduced.len() <= 10);
        assert!(!reduced.is_empty());
    }
}
