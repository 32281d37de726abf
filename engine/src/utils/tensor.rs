use crate::common::*;

/// The L2 norm of all gradients taken together. Parameters without a
/// gradient are skipped.
pub fn grad_norm(params: &[Tensor]) -> f64 {
    tch::no_grad(|| {
        let norms: Vec<_> = params
            .iter()
            .map(|param| param.grad())
            .filter(|grad| grad.defined())
            .map(|grad| grad.norm())
            .collect();

        if norms.is_empty() {
            return 0.0;
        }
        f64::from(&Tensor::stack(&norms, 0).norm())
    })
}

/// Scales gradients in place so that their global L2 norm does not exceed
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(params: &[Tensor], max_norm: f64) -> f64 {
    let total_norm = grad_norm(params);
    let coef = max_norm / (total_norm + 1e-6);

    if coef < 1.0 {
        tch::no_grad(|| {
            params
                .iter()
                .map(|param| param.grad())
                .filter(|grad| grad.defined())
                .for_each(|mut grad| {
                    let scaled = &grad * coef;
                    grad.copy_(&scaled);
                });
        });
    }

    total_norm
}

/// Blocks until queued kernels on a CUDA device finish. No-op on CPU.
pub fn synchronize(device: Device) {
    if let Device::Cuda(index) = device {
        tch::Cuda::synchronize(index as i64);
    }
}
