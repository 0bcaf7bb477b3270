/// Online mean / variance of a scalar stream.
#[derive(Debug, Clone, Default)]
pub struct Welford {
    count: u32,
    mean: f32,
    m2: f32,
}

impl Welford {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, x: f32) {
        self.count += 1;
        let n = self.count as f32;

        let delta = x - self.mean;
        self.mean += delta / n;
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn mean(&self) -> Option<f32> {
        if self.count > 0 { Some(self.mean) } else { None }
    }

    pub fn variance(&self) -> Option<f32> {
        if self.count > 0 {
            Some(self.m2 / self.count as f32)
        } else {
            None
        }
    }
}
