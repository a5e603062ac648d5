//! Viewmark - view marker grammar for docflow
//!
//! Schema declarations mark view destinations with short strings. This crate
//! parses them into a typed [`Marker`]; [`Marker`]'s `Display` writes the same
//! form back, so declarations can be built in code and serialised to YAML.
//!
//! # Grammar (version 1)
//!
//! ```text
//! marker   := kind ("@" version)? ":" body
//! kind     := "View" | "ViewMap" | "ViewArrayMap" | "PeerSync"
//! version  := digits ("." digits)*
//! body     := entity ":" props (":" options)?      -- View, ViewMap, ViewArrayMap
//!           | props (":" options)?                 -- PeerSync
//! props    := ident ("," ident)*
//! options  := ident "=" value ("," ident "=" value)*
//! ident    := [A-Za-z0-9_-]+
//! ```
//!
//! # Examples
//!
//! ```text
//! View:user:name,email
//! ViewMap@1.0.0:member:name,avatar:syncCreate=true
//! ViewArrayMap@2.1.0:server:name
//! PeerSync@1.0.0:title,lastMessage
//! ```
//!
//! Option values are kept as raw text; deciding which options exist and what
//! their values mean is the schema compiler's job.

mod ast;
mod parser;
mod error;

pub use ast::*;
pub use error::ParseError;

/// Parse a marker string into a [`Marker`]
pub fn parse(input: &str) -> Result<Marker, ParseError> {
    parser::parse_marker(input)
}

/// True when `input` starts with a marker keyword. Used to tell markers
/// apart from other strings in a declaration.
pub fn looks_like_marker(input: &str) -> bool {
    let input = input.trim_start();
    input.starts_with("View") || input.starts_with("PeerSync")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_view() {
        let marker = parse("View:user:name,email").unwrap();
        assert!(matches!(marker.kind, MarkerKind::View));
    }

    #[test]
    fn test_parse_error_mentions_position() {
        let err = parse("View:user:name extra").unwrap_err();
        assert!(err.to_string().contains("position"));
    }

    #[test]
    fn test_looks_like_marker() {
        assert!(looks_like_marker("ViewMap:user:name"));
        assert!(looks_like_marker("PeerSync:title"));
        assert!(!looks_like_marker("users"));
    }

    #[test]
    fn test_marker_serializes_to_json() {
        let marker = Marker::peer_sync(["title"]).version("1.0.0");
        let json = serde_json::to_value(&marker).unwrap();
        assert_eq!(json["kind"], "PeerSync");
        assert_eq!(json["props"][0], "title");
    }
}
