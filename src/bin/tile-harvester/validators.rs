use std::time::Duration;

pub fn is_numeric_min(min: usize) -> impl Fn(&str) -> Result<usize, String> + Clone {
    move |v: &str| {
        let val = v
            .parse::<usize>()
            .map_err(|_| "must be numeric".to_owned())?;

        if val < min {
            return Err(format!("must be >= {}", min));
        }

        Ok(val)
    }
}

pub fn is_seconds(v: &str) -> Result<Duration, String> {
    let val = v.parse::<f64>().map_err(|_| "must be numeric".to_owned())?;

    if !val.is_finite() || val < 0f64 {
        return Err("must be a non-negative number of seconds".to_owned());
    }

    Duration::try_from_secs_f64(val).map_err(|e| e.to_string())
}
