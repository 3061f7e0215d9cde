pub const OVERLAY_CLASS: &str = "vimeo-consent-overlay";
pub const BUTTON_CLASS: &str = "vimeo-consent-btn";

pub const PROMPT_OVERLAY: &str = r#"
<div class="vimeo-consent-overlay" data-consent-for="{frame}" data-consent-variant="prompt">
  <div class="vimeo-consent-content">
    <h3>Video Content</h3>
    <p>This video is hosted by {provider} and requires consent to load.</p>
    <div class="vimeo-consent-buttons">
      <button class="vimeo-consent-btn accept">Accept &amp; Play</button>
      <button class="vimeo-consent-btn decline">Decline</button>
    </div>
  </div>
</div>
"#;

pub const DECLINED_OVERLAY: &str = r#"
<div class="vimeo-consent-overlay declined" data-consent-for="{frame}" data-consent-variant="declined">
  <div class="vimeo-consent-content">
    <h3>Video Blocked</h3>
    <p>You declined content from {provider}. This video stays blocked until you allow it.</p>
    <div class="vimeo-consent-buttons">
      <button class="vimeo-consent-btn reprompt">Change my choice</button>
    </div>
  </div>
</div>
"#;

/// Substitutes `{name}` placeholders with HTML-escaped values.
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |html, (name, value)| {
        html.replace(&format!("{{{}}}", name), &escape(value))
    })
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
