//! Parsing of the filter portion of a locator.
//!
//! A locator's query string scopes resolution to a datacenter and/or a set
//! of required tags. Only the `dc` and `tag` keys are meaningful here;
//! anything else in the query string belongs to other layers and must not
//! break resolution, so it is dropped rather than rejected.

/// The recognized filter parameters of a locator, in order of appearance.
///
/// `datacenters` keeps every `dc=` occurrence so that the provider can
/// reject locators naming more than one; the parser itself does not
/// validate cardinality.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub datacenters: Vec<String>,
    pub tags: Vec<String>,
}

impl QueryParams {
    pub fn is_empty(&self) -> bool {
        self.datacenters.is_empty() && self.tags.is_empty()
    }
}

/// Splits a raw query string into [QueryParams].
///
/// Tokens are separated by `&`. A token without `=`, or with nothing after
/// it, carries no value and contributes nothing: `dc=` and `tag=` are
/// ignored. Unrecognized keys are ignored as well.
pub fn split_query(query: Option<&str>) -> QueryParams {
    let mut params = QueryParams::default();
    let Some(query) = query else {
        return params;
    };

    for token in query.split('&') {
        let (key, value) = match token.split_once('=') {
            Some((key, value)) => (key, value),
            None => (token, ""),
        };
        if value.is_empty() {
            continue;
        }
        match key {
            "dc" => params.datacenters.push(value.to_string()),
            "tag" => params.tags.push(value.to_string()),
            _ => (),
        }
    }
    params
}
