use anyhow::{anyhow, Result};
use log::warn;
use std::str::FromStr;
use tch::{Cuda, Device};

pub fn parse_number<T: FromStr>(value: &str, name: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| anyhow!("Invalid value '{}' for {}", value, name))
}

/// Picks the device for a requested GPU count: negative means use CUDA when it
/// is available, zero forces the CPU.
pub fn device_for_gpus(gpus: i64) -> Device {
    match gpus {
        0 => Device::Cpu,
        n if n < 0 => Device::cuda_if_available(),
        n => {
            if !Cuda::is_available() {
                warn!("{} GPU(s) requested but CUDA is not available, using CPU", n);
                return Device::Cpu;
            }
            let available = Cuda::device_count();
            if n > available {
                warn!(
                    "{} GPU(s) requested but only {} available, training runs on cuda:0",
                    n, available
                );
            }
            Device::Cuda(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_number_test() -> Result<()> {
        assert_eq!(parse_number::<usize>(" 16 ", "batch size")?, 16);
        assert!((parse_number::<f64>("0.45", "threshold")? - 0.45).abs() < f64::EPSILON);
        assert!(parse_number::<usize>("-1", "batch size").is_err());
        Ok(())
    }

    #[test]
    fn cpu_device_when_no_gpus() {
        assert_eq!(device_for_gpus(0), Device::Cpu);
    }
}
