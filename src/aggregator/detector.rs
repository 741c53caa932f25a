//! Anomaly detection with configurable thresholds

pub struct AnomalyDetector {
    temperature_threshold: f64,
    vibration_threshold: f64,
}

impl AnomalyDetector {
    pub fn new(temperature_threshold: f64, vibration_threshold: f64) -> Self {
        Self {
            temperature_threshold,
            vibration_threshold,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(70.0, 3.0)
    }

    /// Anomalous when the windowed temperature average OR the windowed
    /// vibration peak is strictly above its threshold
    pub fn is_anomaly(&self, avg_temperature: f64, max_vibration: f64) -> bool {
        avg_temperature > self.temperature_threshold || max_vibration > self.vibration_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temperature_boundary() {
        let detector = AnomalyDetector::with_defaults();

        assert!(!detector.is_anomaly(70.0, 0.5));
        assert!(detector.is_anomaly(70.01, 0.5));
    }

    #[test]
    fn test_vibration_boundary() {
        let detector = AnomalyDetector::with_defaults();

        assert!(!detector.is_anomaly(20.0, 3.0));
        assert!(detector.is_anomaly(20.0, 3.01));
    }

    #[test]
    fn test_either_condition_suffices() {
        let detector = AnomalyDetector::new(50.0, 1.0);

        assert!(detector.is_anomaly(55.0, 0.2));
        assert!(detector.is_anomaly(30.0, 1.5));
        assert!(!detector.is_anomaly(30.0, 0.2));
    }
}
