use consentgate_core::{Consent, GateError, ProviderConfig};
use consentgate_dom::{Document, NodeId, Selector};

use crate::shared::templates::{self, BUTTON_CLASS, OVERLAY_CLASS};

pub const OVERLAY_FOR_ATTR: &str = "data-consent-for";
pub const VARIANT_ATTR: &str = "data-consent-variant";

/// Which overlay a gated frame shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayVariant {
    /// Asks for consent
    Prompt,
    /// Consent was refused; offers a way to reconsider
    Declined,
}

impl OverlayVariant {
    pub fn for_consent(consent: Consent) -> Self {
        match consent {
            Consent::Declined => OverlayVariant::Declined,
            Consent::Unknown | Consent::Granted => OverlayVariant::Prompt,
        }
    }

    fn name(self) -> &'static str {
        match self {
            OverlayVariant::Prompt => "prompt",
            OverlayVariant::Declined => "declined",
        }
    }

    fn template(self) -> &'static str {
        match self {
            OverlayVariant::Prompt => templates::PROMPT_OVERLAY,
            OverlayVariant::Declined => templates::DECLINED_OVERLAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayAction {
    Accept,
    Decline,
    Reprompt,
}

/// Renders overlays and recognizes clicks on them.
pub struct Overlays {
    provider: String,
    overlay: Selector,
    button: Selector,
}

impl Overlays {
    pub fn new(provider: &ProviderConfig) -> Result<Self, GateError> {
        Ok(Self {
            provider: provider.name.clone(),
            overlay: Selector::parse(&format!(".{}", OVERLAY_CLASS))?,
            button: Selector::parse(&format!(".{}", BUTTON_CLASS))?,
        })
    }

    /// Appends an overlay for `frame` to the frame's container, which is
    /// made the overlay's positioning context.
    pub fn render(&self, doc: &mut Document, frame: NodeId, variant: OverlayVariant) -> Option<NodeId> {
        let container = doc.parent_element(frame).unwrap_or_else(|| doc.body());
        doc.set_style(container, "position", "relative");
        let html = templates::fill(
            variant.template(),
            &[("frame", &frame.index().to_string()), ("provider", &self.provider)],
        );
        doc.append_html(container, &html).into_iter().find(|&node| doc.is_element(node))
    }

    /// An overlay already in the document for `frame`, e.g. rendered by an
    /// earlier gate instance.
    pub fn find_existing(&self, doc: &Document, frame: NodeId) -> Option<NodeId> {
        let frame = frame.index().to_string();
        doc.query_selector_all(doc.root(), &self.overlay)
            .into_iter()
            .find(|&overlay| doc.attr(overlay, OVERLAY_FOR_ATTR) == Some(frame.as_str()))
    }

    pub fn variant_of(&self, doc: &Document, overlay: NodeId) -> OverlayVariant {
        match doc.attr(overlay, VARIANT_ATTR) {
            Some(name) if name == OverlayVariant::Declined.name() => OverlayVariant::Declined,
            _ => OverlayVariant::Prompt,
        }
    }

    /// The overlay button `target` sits in, with the overlay it belongs to.
    pub fn action_for(&self, doc: &Document, target: NodeId) -> Option<(OverlayAction, NodeId)> {
        let button = doc.closest(target, &self.button)?;
        let overlay = doc.closest(button, &self.overlay)?;
        let action = if doc.has_class(button, "accept") {
            OverlayAction::Accept
        } else if doc.has_class(button, "decline") {
            OverlayAction::Decline
        } else if doc.has_class(button, "reprompt") {
            OverlayAction::Reprompt
        } else {
            return None;
        };
        Some((action, overlay))
    }
}
