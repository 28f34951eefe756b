//! Request construction: repository URLs and transfer specs.

use std::time::Duration;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

use quarry_fetch_core::driver::{TransferSpec, TransferTag};
use quarry_fetch_core::error::{FetchError, FetchResult};
use quarry_fetch_core::model::{MetadataRequest, RawRequest};

/// Escape set for values embedded in query strings and paths: controls plus
/// the separators the endpoints use.
const ESCAPED: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'=')
    .add(b'?');

fn encode(value: &str) -> String {
    utf8_percent_encode(value, ESCAPED).to_string()
}

pub(crate) fn metadata_spec(
    base: &str,
    request: &MetadataRequest,
    connect_timeout: Option<Duration>,
) -> FetchResult<TransferSpec> {
    let url = match request {
        MetadataRequest::Info { names } => {
            if names.is_empty() || names.iter().any(String::is_empty) {
                return Err(FetchError::Configuration {
                    detail: "info query needs at least one non-empty package name".to_owned(),
                });
            }
            let mut url = format!("{base}/rpc/info");
            for (index, name) in names.iter().enumerate() {
                url.push(if index == 0 { '?' } else { '&' });
                url.push_str("name=");
                url.push_str(&encode(name));
            }
            url
        }
        MetadataRequest::Search { term, field } => {
            if term.is_empty() {
                return Err(FetchError::Configuration {
                    detail: "search query needs a non-empty term".to_owned(),
                });
            }
            format!(
                "{base}/rpc/search?by={}&term={}",
                field.as_token(),
                encode(term)
            )
        }
    };
    Ok(TransferSpec {
        url,
        connect_timeout,
        tag: TransferTag::Metadata,
    })
}

pub(crate) fn raw_spec(
    base: &str,
    request: &RawRequest,
    connect_timeout: Option<Duration>,
) -> FetchResult<TransferSpec> {
    let name = request.name();
    if name.is_empty() {
        return Err(FetchError::Configuration {
            detail: "raw fetch needs a package name".to_owned(),
        });
    }
    let (url, tag) = match request {
        RawRequest::Snapshot { .. } => (
            format!("{base}/archive/{}.tar.gz", encode(name)),
            TransferTag::Snapshot,
        ),
        RawRequest::Recipe { .. } => (format!("{base}/recipe/{}", encode(name)), TransferTag::Recipe),
    };
    Ok(TransferSpec {
        url,
        connect_timeout,
        tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_fetch_core::model::SearchField;

    const BASE: &str = "https://quarry.example.org";

    #[test]
    fn info_queries_repeat_the_name_parameter() {
        let spec = metadata_spec(
            BASE,
            &MetadataRequest::Info {
                names: vec!["foo".into(), "bar".into()],
            },
            None,
        )
        .expect("spec");
        assert_eq!(
            spec.url,
            "https://quarry.example.org/rpc/info?name=foo&name=bar"
        );
        assert_eq!(spec.tag, TransferTag::Metadata);
    }

    #[test]
    fn query_values_are_percent_encoded() {
        let spec = metadata_spec(BASE, &MetadataRequest::info("libc++"), None).expect("spec");
        assert_eq!(
            spec.url,
            "https://quarry.example.org/rpc/info?name=libc%2B%2B"
        );
    }

    #[test]
    fn search_queries_carry_field_and_term() {
        let spec = metadata_spec(
            BASE,
            &MetadataRequest::Search {
                term: "json parser".into(),
                field: SearchField::NameDescription,
            },
            None,
        )
        .expect("spec");
        assert_eq!(
            spec.url,
            "https://quarry.example.org/rpc/search?by=name-desc&term=json%20parser"
        );
    }

    #[test]
    fn raw_requests_map_to_their_endpoints() {
        let snapshot = raw_spec(
            BASE,
            &RawRequest::Snapshot {
                name: "quarry-utils".into(),
            },
            Some(Duration::from_secs(10)),
        )
        .expect("spec");
        assert_eq!(
            snapshot.url,
            "https://quarry.example.org/archive/quarry-utils.tar.gz"
        );
        assert_eq!(snapshot.connect_timeout, Some(Duration::from_secs(10)));

        let recipe = raw_spec(
            BASE,
            &RawRequest::Recipe {
                name: "quarry-utils".into(),
            },
            None,
        )
        .expect("spec");
        assert_eq!(recipe.url, "https://quarry.example.org/recipe/quarry-utils");
        assert_eq!(recipe.tag, TransferTag::Recipe);
    }

    #[test]
    fn empty_targets_are_rejected() {
        assert!(matches!(
            metadata_spec(BASE, &MetadataRequest::Info { names: Vec::new() }, None),
            Err(FetchError::Configuration { .. })
        ));
        assert!(matches!(
            metadata_spec(
                BASE,
                &MetadataRequest::Search {
                    term: String::new(),
                    field: SearchField::Name,
                },
                None
            ),
            Err(FetchError::Configuration { .. })
        ));
        assert!(matches!(
            raw_spec(BASE, &RawRequest::Recipe { name: String::new() }, None),
            Err(FetchError::Configuration { .. })
        ));
    }
}
