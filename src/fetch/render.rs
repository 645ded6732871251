use std::time::Duration;

use thirtyfour::error::WebDriverError;
use thirtyfour::prelude::*;
use tracing::{debug, warn};

use super::{FetchError, FetchPlan};

/// Fetch a page through the WebDriver rendering backend and return the
/// rendered DOM as HTML. A fresh session per fetch keeps recipes with
/// different user agents or proxies from contaminating each other.
pub async fn fetch_rendered(
    webdriver_url: &str,
    url: &str,
    plan: &FetchPlan,
) -> Result<String, FetchError> {
    let mut caps = DesiredCapabilities::chrome();
    caps.set_headless().map_err(render_error)?;
    caps.add_chrome_arg("--no-sandbox").map_err(render_error)?;
    caps.add_chrome_arg("--disable-dev-shm-usage")
        .map_err(render_error)?;

    if let Some(user_agent) = &plan.user_agent {
        caps.add_chrome_arg(&format!("--user-agent={}", user_agent))
            .map_err(render_error)?;
    }

    if let Some(proxy) = &plan.proxy {
        caps.add_chrome_arg(&format!("--proxy-server={}", proxy.to_url()))
            .map_err(render_error)?;
    }

    let driver = WebDriver::new(webdriver_url, caps)
        .await
        .map_err(|e| FetchError::Render(format!("webdriver session failed: {}", e)))?;

    let result = navigate_and_capture(&driver, url, plan).await;

    // always release the session, even on a failed navigation
    if let Err(e) = driver.quit().await {
        warn!(url, "Failed to quit webdriver session: {}", e);
    }

    result
}

async fn navigate_and_capture(
    driver: &WebDriver,
    url: &str,
    plan: &FetchPlan,
) -> Result<String, FetchError> {
    let timeout = Duration::from_secs(plan.timeout_secs);
    driver
        .set_page_load_timeout(timeout)
        .await
        .map_err(render_error)?;

    driver
        .goto(url)
        .await
        .map_err(|e| classify_webdriver_error(e, plan.timeout_secs))?;

    let html = driver.source().await.map_err(render_error)?;
    debug!(url, bytes = html.len(), "Fetched page via rendering backend");
    Ok(html)
}

fn render_error(error: WebDriverError) -> FetchError {
    FetchError::Render(error.to_string())
}

/// Page-load timeouts count against the retry budget like any other
/// transport timeout; everything else is a render failure.
fn classify_webdriver_error(error: WebDriverError, timeout_secs: u64) -> FetchError {
    let message = error.to_string();
    if message.to_lowercase().contains("timeout") {
        FetchError::Timeout(timeout_secs)
    } else {
        FetchError::Render(message)
    }
}
