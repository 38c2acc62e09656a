use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::{error, info};

#[cfg(not(test))]
fn duration(t: u64) -> Duration {
    Duration::from_secs(t)
}
#[cfg(test)]
fn duration(t: u64) -> Duration {
    Duration::from_millis(t * 100)
}

pub async fn retry<T, E, F, U>(retries: usize, mut f: U) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Future<Output = Result<T, E>>,
    U: FnMut() -> F,
{
    let mut last_err = None;
    for i in 0..=retries {
        if last_err.is_some() {
            let secs = 2u64.saturating_pow(u32::try_from(i).unwrap_or(u32::MAX));
            info!("Retry after {secs} seconds");
            sleep(duration(secs)).await;
        }
        match f().await {
            res @ Ok(_) => return res,
            Err(err) => {
                error!("{err:#}");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.expect("last retry reached after error"))
}
