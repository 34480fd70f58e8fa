/// Scalar Kalman filter smoothing the audio/video offset (seconds)
#[derive(Debug, Clone, Copy)]
pub struct KalmanFilter {
    p: f64,
    x: f64,
    q: f64,
    r: f64,
}

impl KalmanFilter {
    /// # Arguments
    /// * `q` - Process noise
    /// * `r` - Measurement noise
    pub fn new(q: f64, r: f64) -> Self {
        Self { p: 1.0, x: 0.0, q, r }
    }

    /// Feed a measurement, returning the new estimate
    pub fn update(&mut self, z: f64) -> f64 {
        let p_next = self.p + self.q;
        let k = p_next / (p_next + self.r);
        self.x += k * (z - self.x);
        self.p = (1.0 - k) * p_next;
        self.x
    }

    pub fn reset(&mut self) {
        self.p = 1.0;
        self.x = 0.0;
    }

    pub fn value(&self) -> f64 {
        self.x
    }
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new(1.0 / 100_000.0, 0.01)
    }
}
