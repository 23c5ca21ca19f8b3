//! Classification of user input into something a source adapter can fetch.

use crate::{error::TransferError, storage::drive::drive_file_id, utils};

use std::collections::HashSet;

use url::Url;

/// Hosts that belong to the storage provider.
pub const STORE_DOMAINS: [&str; 2] = ["drive.google.com", "docs.google.com"];

/// What kind of content a `Reference` points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Already stored remotely, can be cloned without a local round trip.
    RemoteObjectStore,
    /// Plain link, fetched as-is.
    GenericUrl,
    /// Link resolved through the media extractor.
    MediaSiteUrl,
    /// File attached to the chat message.
    AttachedFile,
}

/// Which workflow the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workflow {
    /// `/download`, a bare link or an attachment.
    Link,
    /// `/ytdl`.
    MediaSite,
}

/// Handle to a file attached to a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedFile {
    /// Platform file identifier.
    pub file_id: String,
    /// Name reported by the platform, if any.
    pub file_name: Option<String>,
    /// Mime type reported by the platform, if any.
    pub mime_type: Option<String>,
    /// Size in bytes as reported by the platform (0 when unknown).
    pub size: u64,
}

/// A classified, immutable pointer to content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    raw: String,
    kind: ReferenceKind,
    link: Option<Url>,
    output_name: Option<String>,
    attachment: Option<AttachedFile>,
    media_site: bool,
}

impl Reference {
    /// The text the user sent.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Classified kind.
    pub const fn kind(&self) -> ReferenceKind {
        self.kind
    }

    /// The link, for every kind but `AttachedFile`.
    pub const fn link(&self) -> Option<&Url> {
        self.link.as_ref()
    }

    /// Explicit output file name from the `link|name` convention.
    pub fn output_name(&self) -> Option<&str> {
        self.output_name.as_deref()
    }

    /// The attached file, for `AttachedFile`.
    pub const fn attachment(&self) -> Option<&AttachedFile> {
        self.attachment.as_ref()
    }

    /// Whether a generic link points at a known media site.
    pub const fn looks_like_media_site(&self) -> bool {
        self.media_site
    }

    /// Best-effort name for status messages, before the real file name is known.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.output_name {
            return name.clone();
        }
        if let Some(name) = self.attachment.as_ref().and_then(|a| a.file_name.clone()) {
            return name;
        }
        // store links end in `view` or `edit`, the id is the useful part
        if self.kind == ReferenceKind::RemoteObjectStore {
            return self
                .link
                .as_ref()
                .and_then(drive_file_id)
                .unwrap_or_else(|| self.raw.clone());
        }
        self.link
            .as_ref()
            .and_then(utils::file_name_from_url)
            .unwrap_or_else(|| self.raw.clone())
    }
}

/// Splits raw input into references.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    /// Registrable domains treated as media sites, e.g. `youtube.com`.
    media_sites: HashSet<String>,
}

impl Classifier {
    /// Create a classifier aware of the given media sites.
    pub fn new(media_sites: impl IntoIterator<Item = String>) -> Self {
        Self {
            media_sites: media_sites.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// Classify user input, optionally accompanied by an attached file.
    pub fn classify(
        &self,
        raw_text: &str,
        attached: Option<AttachedFile>,
        workflow: Workflow,
    ) -> Result<Reference, TransferError> {
        let raw = raw_text.trim().to_string();

        // link|name
        let (link_part, output_name) = match raw.split_once('|') {
            Some((link, name)) => (link.trim(), utils::sanitize_file_name(name)),
            None => (raw.as_str(), None),
        };

        if let Some(attachment) = attached {
            // a caption is not a link; treat the whole text as a name only if it came with `|`
            let output_name = if raw.contains('|') {
                output_name
            } else {
                None
            };
            return Ok(Reference {
                raw,
                kind: ReferenceKind::AttachedFile,
                link: None,
                output_name,
                attachment: Some(attachment),
                media_site: false,
            });
        }

        let link = Self::extract_link(link_part)?;

        let kind = if Self::is_store_link(&link) {
            ReferenceKind::RemoteObjectStore
        } else if workflow == Workflow::MediaSite {
            ReferenceKind::MediaSiteUrl
        } else {
            ReferenceKind::GenericUrl
        };

        let media_site = kind == ReferenceKind::GenericUrl
            && utils::site_of(&link).is_some_and(|site| self.media_sites.contains(&site));

        Ok(Reference {
            raw,
            kind,
            link: Some(link),
            output_name,
            attachment: None,
            media_site,
        })
    }

    /// Find exactly one http(s) URL in the text.
    fn extract_link(text: &str) -> Result<Url, TransferError> {
        let found = utils::find_urls(text);

        let candidate = match found.as_slice() {
            [one] => *one,
            [] => text,
            _ => {
                return Err(TransferError::UnrecognizedReference(
                    "more than one link in a single request".to_string(),
                ));
            }
        };

        let url = Url::parse(candidate).map_err(|_| {
            TransferError::UnrecognizedReference(format!("`{text}` is not a link"))
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransferError::UnrecognizedReference(format!(
                "unsupported scheme `{}`",
                url.scheme()
            )));
        }

        Ok(url)
    }

    /// Whether the link points into the storage provider.
    fn is_store_link(url: &Url) -> bool {
        url.host_str().is_some_and(|host| {
            let host = host.to_lowercase();
            STORE_DOMAINS.iter().any(|domain| host == *domain)
        })
    }
}
