//! Gaussian convolution kernels.

use super::BlurError;

/// A square convolution kernel, normalized so its weights sum to 1.
#[derive(Debug, Clone)]
pub struct Kernel {
    size: u32,
    weights: Vec<f64>,
}

impl Kernel {
    /// Generates a normalized Gaussian kernel of the given (odd) size.
    ///
    /// Sigma is `size / 3`, so the kernel tapers to near zero at its edge.
    /// A size of 1 yields the identity kernel.
    ///
    /// # Errors
    ///
    /// Returns [`BlurError::InvalidKernelSize`] if `size` is zero or even.
    pub fn gaussian(size: u32) -> Result<Self, BlurError> {
        if size == 0 || size % 2 == 0 {
            return Err(BlurError::InvalidKernelSize(size));
        }

        let sigma = f64::from(size) / 3.0;
        let center = i64::from(size / 2);
        let mut weights = Vec::with_capacity((size * size) as usize);
        let mut sum = 0.0;

        for ky in 0..i64::from(size) {
            for kx in 0..i64::from(size) {
                let x = (kx - center) as f64;
                let y = (ky - center) as f64;
                let w = (-(x * x + y * y) / (2.0 * sigma * sigma)).exp()
                    / (2.0 * std::f64::consts::PI * sigma * sigma);
                weights.push(w);
                sum += w;
            }
        }

        for w in &mut weights {
            *w /= sum;
        }

        Ok(Self { size, weights })
    }

    /// The identity kernel (size 1, single weight of 1.0).
    pub fn identity() -> Self {
        Self {
            size: 1,
            weights: vec![1.0],
        }
    }

    /// Kernel edge length.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Half the kernel size: the padding a tile needs on each side.
    #[inline]
    pub fn padding(&self) -> u32 {
        self.size / 2
    }

    /// Weight at kernel position `(kx, ky)`.
    #[inline]
    pub fn weight(&self, kx: u32, ky: u32) -> f64 {
        self.weights[(ky * self.size + kx) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_rejects_even_and_zero() {
        assert!(Kernel::gaussian(0).is_err());
        assert!(Kernel::gaussian(4).is_err());
        assert!(Kernel::gaussian(15).is_ok());
    }

    #[test]
    fn test_gaussian_is_normalized() {
        for size in [1, 3, 7, 15] {
            let kernel = Kernel::gaussian(size).unwrap();
            let sum: f64 = (0..size)
                .flat_map(|ky| (0..size).map(move |kx| (kx, ky)))
                .map(|(kx, ky)| kernel.weight(kx, ky))
                .sum();
            assert!((sum - 1.0).abs() < 1e-9, "size {} sums to {}", size, sum);
        }
    }

    #[test]
    fn test_gaussian_peak_is_center() {
        let kernel = Kernel::gaussian(7).unwrap();
        let center = kernel.weight(3, 3);
        assert!(center > kernel.weight(0, 0));
        assert!(center > kernel.weight(6, 3));
    }

    #[test]
    fn test_size_one_is_identity() {
        let kernel = Kernel::gaussian(1).unwrap();
        assert_eq!(kernel.padding(), 0);
        assert!((kernel.weight(0, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_padding_is_half_size() {
        assert_eq!(Kernel::gaussian(15).unwrap().padding(), 7);
        assert_eq!(Kernel::gaussian(3).unwrap().padding(), 1);
        assert_eq!(Kernel::identity().padding(), 0);
    }
}
