use consentgate::{ConsentGate, CookieBridge};
use consentgate_core::{GateConfig, GateState, RetryConfig, SystemClock};
use consentgate_scheduler::{EventLoop, Page, PageEvent};
use consentgate_storage::{CookieJar, StorageArea};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const PAGE: &str = r#"
<html><body>
  <div class="cookie-banner">
    <p>We use cookies.</p>
    <a class="consent-link">Accept</a>
    <a class="decline-link">Decline</a>
  </div>
  <article>
    <div class="video"><iframe src="https://player.vimeo.com/video/76979871"></iframe></div>
    <div class="video"><iframe src="https://player.vimeo.com/video/22439234"></iframe></div>
  </article>
</body></html>
"#;

fn summary(name: &str, gate: &ConsentGate) {
    let loaded = gate.frames().iter().filter(|f| f.state == GateState::Loaded).count();
    println!("{}: {}/{} videos loaded", name, loaded, gate.frames().len());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let area = StorageArea::new();
    let cookies = CookieJar::new();
    let config = GateConfig::default()
        .with_retry(RetryConfig::patient())
        .with_retention_days(30);

    // Two tabs of the same site
    let mut first = Page::open(PAGE, &area, &cookies, Arc::new(SystemClock));
    let mut first_loop = EventLoop::new();
    let first_gate = ConsentGate::install(&mut first_loop, &mut first, config.clone())?;
    CookieBridge::new(&first, &config)?
        .with_gate(first_gate.clone())
        .install(&mut first_loop, &mut first);

    let mut second = Page::open(PAGE, &area, &cookies, Arc::new(SystemClock));
    let mut second_loop = EventLoop::new();
    let second_gate = ConsentGate::install(&mut second_loop, &mut second, config.clone())?;

    first_loop.run_until_idle(&mut first);
    second_loop.run_until_idle(&mut second);
    summary("first tab", &first_gate);
    summary("second tab", &second_gate);

    let accept = first.query(".cookie-banner .consent-link").ok_or("banner missing")?;
    let sender = first_loop.sender();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = sender.send(PageEvent::Click { target: accept });
    });
    first_loop.run_for(&mut first, Duration::from_millis(200)).await;
    second_loop.run_for(&mut second, Duration::from_millis(50)).await;

    summary("first tab", &first_gate);
    summary("second tab", &second_gate);
    println!("cookie header: {}", cookies.header(first.now_ms()));
    Ok(())
}
