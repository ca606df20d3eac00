use feed_rs::parser;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use thiserror::Error;

use super::fetcher::{ContentKind, RawFetchResult};
use crate::storage::NormalizedEntry;

#[derive(Debug, Error)]
pub enum ParseError {
    /// Body declared as JSON but not a valid domain listing
    #[error("Malformed JSON listing: {0}")]
    Json(#[from] serde_json::Error),
    /// Body declared as XML but not a valid RSS/Atom document
    #[error("Malformed syndication feed: {0}")]
    Xml(#[from] parser::ParseFeedError),
    /// Body is not well-formed XML (unclosed or mismatched elements)
    #[error("Malformed syndication feed: {0}")]
    IllFormedXml(String),
    /// No parser exists for the declared content type. Never retried.
    #[error("Unsupported content kind: {kind:?}")]
    UnsupportedContentKind { kind: String },
}

/// Lazy sequence of entries produced by [`parse`].
///
/// The document is fully validated before the first entry is yielded, so a
/// malformed body never produces partial output. Entries are converted one at
/// a time as the sequence is consumed; it can be consumed only once.
pub struct Entries {
    source: EntrySource,
}

enum EntrySource {
    DomainListing(std::vec::IntoIter<DomainRecord>),
    Syndication(std::vec::IntoIter<feed_rs::model::Entry>),
}

impl Iterator for Entries {
    type Item = NormalizedEntry;

    fn next(&mut self) -> Option<NormalizedEntry> {
        match &mut self.source {
            EntrySource::DomainListing(records) => records.next().map(DomainRecord::into_entry),
            EntrySource::Syndication(entries) => entries.next().map(syndication_entry),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match &self.source {
            EntrySource::DomainListing(records) => records.size_hint(),
            EntrySource::Syndication(entries) => entries.size_hint(),
        }
    }
}

impl ExactSizeIterator for Entries {}

/// Parse a fetched body into normalized entries, dispatching on its content kind.
///
/// Performs no I/O.
pub fn parse(raw: RawFetchResult) -> Result<Entries, ParseError> {
    let source = match raw.content_kind {
        ContentKind::JsonListing => EntrySource::DomainListing(parse_domain_listing(&raw.body)?),
        ContentKind::SyndicationXml => {
            check_well_formed(&raw.body)?;
            EntrySource::Syndication(parser::parse(raw.body.as_slice())?.entries.into_iter())
        }
        ContentKind::Unknown => {
            return Err(ParseError::UnsupportedContentKind {
                kind: raw.content_type,
            })
        }
    };
    Ok(Entries { source })
}

// ============================================================================
// Syndication (RSS/Atom)
// ============================================================================

/// Reject documents feed-rs would accept leniently.
///
/// feed-rs stops at the last complete element, so a body cut off before the
/// closing root tag would otherwise yield the entries read so far.
fn check_well_formed(body: &[u8]) -> Result<(), ParseError> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().check_end_names = true;

    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ParseError::IllFormedXml(e.to_string())),
        }
    }

    if depth > 0 {
        return Err(ParseError::IllFormedXml(format!(
            "document ended with {} unclosed element(s)",
            depth
        )));
    }
    Ok(())
}

fn syndication_entry(entry: feed_rs::model::Entry) -> NormalizedEntry {
    let title = entry.title.map(|t| t.content).unwrap_or_default();
    let description = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .unwrap_or_default();
    let link = entry
        .links
        .into_iter()
        .next()
        .map(|l| l.href)
        .unwrap_or_default();

    NormalizedEntry {
        title,
        description,
        link,
    }
}

// ============================================================================
// Domain listing (JSON)
// ============================================================================

/// Shape of the domain-search API responses this adapter understands:
/// `{"domains": [{"domain": "...", "create_date": "...", "update_date": "..."}]}`.
///
/// This is not a general JSON feed format. Other JSON sources need their own adapter.
#[derive(Debug, Deserialize)]
struct DomainListing {
    #[serde(default)]
    domains: Option<Vec<DomainRecord>>,
}

#[derive(Debug, Deserialize)]
struct DomainRecord {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    create_date: Option<String>,
    #[serde(default)]
    update_date: Option<String>,
}

impl DomainRecord {
    fn into_entry(self) -> NormalizedEntry {
        let description = format!(
            "Created: {}, Updated: {}",
            self.create_date.as_deref().unwrap_or("unknown"),
            self.update_date.as_deref().unwrap_or("unknown")
        );
        let name = self.domain.unwrap_or_default();

        // The listing has no URL field, so the domain name doubles as the link.
        // It is usually not a resolvable URL.
        NormalizedEntry {
            title: name.clone(),
            description,
            link: name,
        }
    }
}

fn parse_domain_listing(body: &[u8]) -> Result<std::vec::IntoIter<DomainRecord>, ParseError> {
    // Deserializing into a struct rejects non-object top levels (arrays, strings, ...)
    let listing: DomainListing = serde_json::from_slice(body)?;
    Ok(listing.domains.unwrap_or_default().into_iter())
}
