//! Marker parser using nom
//!
//! Parses marker strings into [`Marker`] values.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1},
    combinator::{map, opt, recognize, value},
    multi::{separated_list1, many0},
    sequence::{pair, preceded},
};

use crate::ast::*;
use crate::error::ParseError;

/// Parse a complete marker
pub fn parse_marker(input: &str) -> Result<Marker, ParseError> {
    let trimmed = input.trim();
    let (remaining, parsed) = marker(trimmed)?;

    if !remaining.is_empty() {
        let position = trimmed.len() - remaining.len();
        return Err(ParseError::new(format!("Unexpected trailing content: {}", remaining))
            .with_position(position));
    }

    Ok(parsed)
}

// ============================================================================
// Marker Parsers
// ============================================================================

fn marker(input: &str) -> IResult<&str, Marker> {
    let (input, kind) = kind(input)?;
    let (input, version) = opt(preceded(char('@'), version))(input)?;
    let (input, src_entity) = match kind {
        MarkerKind::PeerSync => (input, None),
        _ => map(preceded(char(':'), identifier), |s: &str| Some(s.to_string()))(input)?,
    };
    let (input, props) = preceded(char(':'), prop_list)(input)?;
    let (input, options) = opt(preceded(char(':'), option_list))(input)?;

    Ok((input, Marker {
        kind,
        version: version.map(str::to_string),
        src_entity,
        props,
        options: options.unwrap_or_default(),
    }))
}

fn kind(input: &str) -> IResult<&str, MarkerKind> {
    // Longest keyword first: `View` is a prefix of the others.
    alt((
        value(MarkerKind::ViewArrayMap, tag("ViewArrayMap")),
        value(MarkerKind::ViewMap, tag("ViewMap")),
        value(MarkerKind::View, tag("View")),
        value(MarkerKind::PeerSync, tag("PeerSync")),
    ))(input)
}

fn version(input: &str) -> IResult<&str, &str> {
    recognize(pair(digit1, many0(preceded(char('.'), digit1))))(input)
}

fn prop_list(input: &str) -> IResult<&str, Vec<String>> {
    separated_list1(char(','), map(identifier, str::to_string))(input)
}

fn option_list(input: &str) -> IResult<&str, Vec<MarkerOption>> {
    separated_list1(char(','), option)(input)
}

/// One `name[=value]` entry, kept raw. A missing or empty value is left
/// for the consumer to reject.
fn option(input: &str) -> IResult<&str, MarkerOption> {
    map(take_while1(|c: char| c != ',' && c != ':'), |raw: &str| {
        let (name, value) = raw.split_once('=').unwrap_or((raw, ""));
        MarkerOption {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        }
    })(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_view() {
        let m = parse_marker("View:user:name,email").unwrap();
        assert_eq!(m.kind, MarkerKind::View);
        assert_eq!(m.version, None);
        assert_eq!(m.src_entity.as_deref(), Some("user"));
        assert_eq!(m.props, vec!["name", "email"]);
        assert!(m.options.is_empty());
    }

    #[test]
    fn test_parse_versioned_map_with_options() {
        let m = parse_marker("ViewMap@1.2.0:member:name,avatar:syncCreate=true").unwrap();
        assert_eq!(m.kind, MarkerKind::ViewMap);
        assert_eq!(m.version.as_deref(), Some("1.2.0"));
        assert_eq!(m.options.len(), 1);
        assert_eq!(m.options[0].name, "syncCreate");
        assert_eq!(m.options[0].value, "true");
    }

    #[test]
    fn test_parse_array_map_is_not_map() {
        let m = parse_marker("ViewArrayMap@2:server:name").unwrap();
        assert_eq!(m.kind, MarkerKind::ViewArrayMap);
        assert_eq!(m.version.as_deref(), Some("2"));
    }

    #[test]
    fn test_parse_peer_sync() {
        let m = parse_marker("PeerSync@1.0.0:title,lastMessage").unwrap();
        assert_eq!(m.kind, MarkerKind::PeerSync);
        assert_eq!(m.src_entity, None);
        assert_eq!(m.props, vec!["title", "lastMessage"]);
    }

    #[test]
    fn test_option_values_are_kept_raw() {
        let m = parse_marker("View:user:name:syncCreate=yes,colour=blue").unwrap();
        assert_eq!(m.options[0].value, "yes");
        assert_eq!(m.options[1].name, "colour");
    }

    #[test]
    fn test_malformed_options_still_parse() {
        let m = parse_marker("View:user:name:syncCreate").unwrap();
        assert_eq!(m.props, vec!["name"]);
        assert_eq!(m.options[0].name, "syncCreate");
        assert_eq!(m.options[0].value, "");

        let m = parse_marker("View:user:name:syncCreate=,colour=blue").unwrap();
        assert_eq!(m.options.len(), 2);
        assert_eq!(m.options[0].value, "");
        assert_eq!(m.options[1].value, "blue");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_marker("Viewer:user:name").is_err());
        assert!(parse_marker("View:user").is_err());
        assert!(parse_marker("View@x:user:name").is_err());
        assert!(parse_marker("View:user:name:").is_err());
    }

    #[test]
    fn test_display_reparses() {
        let m = Marker::view_array_map("user", ["name", "email"])
            .version("1.0.0")
            .sync_create(true);
        let text = m.to_string();
        assert_eq!(text, "ViewArrayMap@1.0.0:user:name,email:syncCreate=true");
        assert_eq!(parse_marker(&text).unwrap(), m);
    }
}
