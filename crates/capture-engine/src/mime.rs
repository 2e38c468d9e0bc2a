//! Container/codec negotiation.
//!
//! The negotiator walks an ordered preference list once and returns the
//! first entry the platform can encode. Order encodes priority: the most
//! widely playable combination goes first, progressively weaker fallbacks
//! after it.

use synthcast_media_model::ContainerFormat;

/// Platform capability query, the equivalent of asking a recorder whether a
/// given mime type is encodable.
pub trait FormatSupport {
    fn is_type_supported(&self, format: &ContainerFormat) -> bool;
}

/// Return the first preference the platform supports.
pub fn negotiate<P>(preferences: &[ContainerFormat], platform: &P) -> Option<ContainerFormat>
where
    P: FormatSupport + ?Sized,
{
    preferences
        .iter()
        .find(|format| platform.is_type_supported(format))
        .copied()
}

/// An ordered list of acceptable recording formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeNegotiator {
    preferences: Vec<ContainerFormat>,
}

impl MimeNegotiator {
    pub fn new(preferences: Vec<ContainerFormat>) -> Self {
        Self { preferences }
    }

    /// Build from mime strings (as stored in config). Unparseable entries are
    /// skipped with a warning so one typo does not disable recording.
    pub fn from_mime_strings<S: AsRef<str>>(mimes: &[S]) -> Self {
        let preferences = mimes
            .iter()
            .filter_map(|mime| match mime.as_ref().parse::<ContainerFormat>() {
                Ok(format) => Some(format),
                Err(e) => {
                    tracing::warn!(mime = mime.as_ref(), error = %e, "Ignoring format preference");
                    None
                }
            })
            .collect();
        Self { preferences }
    }

    pub fn preferences(&self) -> &[ContainerFormat] {
        &self.preferences
    }

    pub fn negotiate<P>(&self, platform: &P) -> Option<ContainerFormat>
    where
        P: FormatSupport + ?Sized,
    {
        let chosen = negotiate(&self.preferences, platform);
        match chosen {
            Some(format) => tracing::debug!(mime = %format, "Negotiated recording format"),
            None => tracing::debug!(
                candidates = self.preferences.len(),
                "No recording format supported"
            ),
        }
        chosen
    }
}

impl Default for MimeNegotiator {
    fn default() -> Self {
        Self::from_mime_strings(
            &synthcast_common::config::RecordingDefaults::default().format_preferences,
        )
    }
}
