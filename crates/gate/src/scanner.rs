use consentgate_core::{GateError, ProviderConfig, VideoId};
use consentgate_dom::{Descendants, Document, NodeId, Selector};
use tracing::debug;
use url::Url;

/// Marker left on a frame once the gate has processed it.
pub const STATE_ATTR: &str = "data-consent-state";
/// Where a gated frame's real source is kept until consent.
pub const WITHHELD_SRC_ATTR: &str = "data-consent-src";
/// Source attribute some pages server-render instead of `src`.
pub const DEFERRED_SRC_ATTR: &str = "data-src";

/// What a scan finds on a frame, read from its marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Never processed
    Fresh,
    Gated,
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoElement {
    pub id: VideoId,
    pub node: NodeId,
    /// Real embed URL, captured before anything is fetched
    pub source: String,
    pub state: FrameState,
}

pub struct FrameScanner {
    provider: ProviderConfig,
    frames: Selector,
}

impl FrameScanner {
    pub fn new(provider: &ProviderConfig) -> Result<Self, GateError> {
        Ok(Self {
            provider: provider.clone(),
            frames: Selector::parse(&provider.frame_selector)?,
        })
    }

    /// Lazily walks `root` once. Frames from other providers are not
    /// candidates; provider frames with an unexpected URL shape are skipped.
    pub fn discover<'a>(&'a self, doc: &'a Document, root: NodeId) -> Discover<'a> {
        Discover { scanner: self, doc, nodes: doc.descendants(root) }
    }

    /// `Ok(None)` for URLs outside the provider's domain.
    pub fn parse_embed(&self, url: &str) -> Result<Option<VideoId>, GateError> {
        let domain = self.provider.domain.to_ascii_lowercase();
        let absolute = if url.starts_with("//") { format!("https:{}", url) } else { url.to_string() };
        let parsed = match Url::parse(&absolute) {
            Ok(parsed) => parsed,
            Err(_) if url.to_ascii_lowercase().contains(&domain) => {
                return Err(GateError::unrecognized_embed(url));
            }
            Err(_) => return Ok(None),
        };
        let on_domain = parsed
            .host_str()
            .is_some_and(|host| host == domain || host.ends_with(&format!(".{}", domain)));
        if !on_domain {
            return Ok(None);
        }

        let segments: Vec<&str> = parsed.path_segments().map(|s| s.collect()).unwrap_or_default();
        match segments.as_slice() {
            [segment, id, ..] if *segment == self.provider.id_segment => id
                .parse::<u64>()
                .map(|id| Some(VideoId(id)))
                .map_err(|_| GateError::unrecognized_embed(url)),
            _ => Err(GateError::unrecognized_embed(url)),
        }
    }

    fn classify(&self, doc: &Document, node: NodeId) -> Option<VideoElement> {
        let source = [WITHHELD_SRC_ATTR, "src", DEFERRED_SRC_ATTR]
            .iter()
            .find_map(|attr| doc.attr(node, attr).filter(|value| !value.trim().is_empty()))?
            .trim();
        let id = match self.parse_embed(source) {
            Ok(Some(id)) => id,
            Ok(None) => return None,
            Err(err) => {
                debug!(%node, error = %err, "Skipping provider frame");
                return None;
            }
        };
        let state = match doc.attr(node, STATE_ATTR) {
            Some("gated") => FrameState::Gated,
            Some("loaded") => FrameState::Loaded,
            _ => FrameState::Fresh,
        };
        Some(VideoElement { id, node, source: source.to_string(), state })
    }
}

/// One-shot scan: create a new one to see later DOM changes.
pub struct Discover<'a> {
    scanner: &'a FrameScanner,
    doc: &'a Document,
    nodes: Descendants<'a>,
}

impl Iterator for Discover<'_> {
    type Item = VideoElement;

    fn next(&mut self) -> Option<VideoElement> {
        loop {
            let node = self.nodes.next()?;
            if !self.scanner.frames.matches(self.doc, node) {
                continue;
            }
            if let Some(video) = self.scanner.classify(self.doc, node) {
                return Some(video);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consentgate_core::ErrorCategory;

    fn scanner() -> FrameScanner {
        FrameScanner::new(&ProviderConfig::default()).unwrap()
    }

    #[test]
    fn extracts_numeric_id_from_embed_urls() {
        let s = scanner();
        for url in [
            "https://player.vimeo.com/video/76979871",
            "https://player.vimeo.com/video/76979871?h=8272103f6e&autoplay=1",
            "//player.vimeo.com/video/76979871/",
            "https://PLAYER.VIMEO.COM/video/76979871#t=30s",
        ] {
            assert_eq!(s.parse_embed(url).unwrap(), Some(VideoId(76979871)), "{url}");
        }
    }

    #[test]
    fn foreign_urls_are_not_candidates() {
        let s = scanner();
        for url in [
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://notvimeo.com/video/1",
            "/video/1",
            "about:blank",
        ] {
            assert_eq!(s.parse_embed(url).unwrap(), None, "{url}");
        }
    }

    #[test]
    fn provider_urls_with_wrong_shape_are_unrecognized() {
        let s = scanner();
        for url in [
            "https://vimeo.com/channels/staffpicks",
            "https://player.vimeo.com/video/abc",
            "https://player.vimeo.com/",
            "https://player.vimeo.com:notaport/video/1",
        ] {
            let err = s.parse_embed(url).unwrap_err();
            assert_eq!(err.category, ErrorCategory::UnrecognizedEmbed, "{url}");
        }
    }

    #[test]
    fn discover_classifies_and_skips() {
        let doc = Document::parse(
            r#"<body>
                <iframe src="https://player.vimeo.com/video/1"></iframe>
                <iframe data-consent-src="https://player.vimeo.com/video/2" data-consent-state="gated"></iframe>
                <iframe src="https://player.vimeo.com/video/3" data-consent-state="loaded"></iframe>
                <iframe data-src="https://player.vimeo.com/video/4"></iframe>
                <iframe src="https://vimeo.com/channels/staffpicks"></iframe>
                <iframe src="https://www.youtube.com/embed/x"></iframe>
                <iframe></iframe>
                <div data-src="https://player.vimeo.com/video/5"></div>
            </body>"#,
        );
        let found: Vec<(u64, FrameState)> = scanner()
            .discover(&doc, doc.root())
            .map(|video| (video.id.0, video.state))
            .collect();
        assert_eq!(
            found,
            vec![
                (1, FrameState::Fresh),
                (2, FrameState::Gated),
                (3, FrameState::Loaded),
                (4, FrameState::Fresh),
            ]
        );
    }

    #[test]
    fn discover_is_limited_to_root() {
        let doc = Document::parse(
            r#"<section id="a"><iframe src="https://player.vimeo.com/video/1"></iframe></section>
               <section id="b"><iframe src="https://player.vimeo.com/video/2"></iframe></section>"#,
        );
        let root = doc.query_selector(doc.root(), &Selector::parse("#b").unwrap()).unwrap();
        let ids: Vec<VideoId> = scanner().discover(&doc, root).map(|v| v.id).collect();
        assert_eq!(ids, vec![VideoId(2)]);
    }
}
