/// Measures the time duration of the provided closure and reports it through
/// the logger, at `debug` level unless a `log::Level` is given.
/// The $msg param is a short identifier of the measured stage, so that the
/// timings of the data pipeline and the trainer are easy to tell apart.
///
/// # Example
///
/// ```no run
/// # fn main {
///     let sample = measure_time!("rasterize sample", || dataset.get(0));
///     measure_time!("save checkpoint", || net.save(path), log::Level::Info)?;
/// #}
#[macro_export]
macro_rules! measure_time {
    ($msg: expr, $fn: expr) => {
        $crate::measure_time!($msg, $fn, log::Level::Debug)
    };
    ($msg: expr, $fn: expr, $level: expr) => {{
        let instant = std::time::Instant::now();
        let res = $fn();
        log::log!(
            $level,
            "Finished \"{}\" in {} ms",
            $msg,
            instant.elapsed().as_millis(),
        );
        res
    }};
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    #[test]
    fn measure_time_no_return_value() {
        let mut counter = 0;
        measure_time!("increment", || {
            counter += 1;
        });
        assert_eq!(counter, 1);
    }

    #[test]
    fn measure_time_with_return_value() {
        let polygons = vec![4, 4, 4];
        assert_eq!(
            measure_time!(
                "count points",
                || polygons.iter().sum::<i32>(),
                log::Level::Info
            ),
            12
        );
    }

    #[test]
    fn measure_time_keeps_result() -> Result<()> {
        let ok = measure_time!("parse ok", || -> Result<f64> { Ok("0.4".parse::<f64>()?) });
        assert!((ok? - 0.4).abs() < f64::EPSILON);

        let err = measure_time!(
            "parse err",
            || -> Result<f64> { Err(anyhow!("not a number")) },
            log::Level::Warn
        );
        assert!(err.is_err());
        Ok(())
    }
}
