use std::collections::BTreeMap;

use scraper::{Html, Selector};
use url::Url;

use crate::profile::FieldRule;

/// Title used when a listing carries no label for an item. Some sites only
/// reveal the name on the detail page.
pub const UNTITLED_PLACEHOLDER: &str = "untitled";

/// Untyped key/value bundle as yielded by a profile's extraction procedure.
/// Reserved keys: `title`, `image`, `url`, `value`, `unit`. Anything else is
/// carried through into `Record::extra`.
pub type RawItem = BTreeMap<String, String>;

/// One canonical extracted item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub title: String,
    /// Absolute URL after normalization; empty when the site has none.
    pub image_url: String,
    /// Absolute URL after normalization; primary identity source.
    pub detail_url: String,
    /// Point/price/coin cost, digits only.
    pub value: Option<u64>,
    /// Unit metadata ("pt", "円", ...) kept apart from the numeric value.
    pub unit: Option<String>,
    /// Site-specific auxiliary fields, e.g. remaining stock or rarity.
    pub extra: BTreeMap<String, String>,
}

impl Record {
    /// Identity key: normalized detail URL when present, image URL otherwise.
    /// Callers must have dropped records where both are empty.
    pub fn identity_key(&self) -> String {
        if !self.detail_url.is_empty() {
            identity_of(&self.detail_url)
        } else {
            identity_of(&self.image_url)
        }
    }
}

/// Reduce a URL to the scheme+host+path form used for dedup. Query and
/// fragment never participate in identity; two listings that differ only in
/// cache-buster params denote the same item.
pub fn identity_of(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw.trim()) else {
        return raw.trim().to_string();
    };
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

/// Canonicalize a raw href/src from a listing: resolve relative paths against
/// the listing URL, unwrap proxy/CDN indirection, strip tracking params and
/// fragments. Idempotent; returns `None` for empty or non-http(s) input.
pub fn normalize_url(raw: &str, base: &Url) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut url = base.join(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    // Image proxies like /_next/image?url=<origin>&w=640 encode the real
    // resource in a query param. Unwrap until none is left, with a hop bound
    // in case a site nests them.
    for _ in 0..4 {
        let Some(inner) = wrapped_origin_url(&url) else {
            break;
        };
        url = inner;
    }

    let kept_params = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_query_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    if kept_params.is_empty() {
        url.set_query(None);
    } else {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in kept_params {
            serializer.append_pair(&k, &v);
        }
        url.set_query(Some(&serializer.finish()));
    }

    url.set_fragment(None);
    Some(url.to_string())
}

fn wrapped_origin_url(url: &Url) -> Option<Url> {
    url.query_pairs()
        .find(|(k, _)| matches!(k.as_ref(), "url" | "src" | "image"))
        .and_then(|(_, v)| Url::parse(&v).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
}

fn is_tracking_query_param(param: &str) -> bool {
    let name = param.to_ascii_lowercase();
    if name.starts_with("utm_") || name.starts_with("gad_") {
        return true;
    }
    matches!(
        name.as_str(),
        "gclid" | "fbclid" | "gbraid" | "wbraid" | "_gl" | "mc_cid" | "mc_eid" | "ref"
    )
}

/// Pull the first run of digits out of free text like "1,000pt" or
/// "／1回 1,000円". Commas are permitted as thousands separators inside the
/// run. No digits ("売り切れ", "") is a normal outcome, not an error.
pub fn coerce_value(text: &str) -> Option<u64> {
    let (value, _) = split_value(text);
    value
}

/// Like `coerce_value`, but also returns the unit suffix directly following
/// the digit run ("pt", "円", ...), if any.
pub fn split_value(text: &str) -> (Option<u64>, Option<String>) {
    let chars = text.chars().collect::<Vec<_>>();
    let mut digits = String::new();
    let mut end = None;

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_digit() {
            digits.push(c);
            end = Some(i + 1);
        } else if !digits.is_empty() {
            // A comma only continues the run when digits follow it.
            let continues = (c == ',' || c == '，')
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
            if !continues {
                break;
            }
        }
    }

    let value = if digits.is_empty() {
        None
    } else {
        digits.parse::<u64>().ok()
    };

    let unit = end.map(|idx| {
        chars[idx..]
            .iter()
            .skip_while(|c| c.is_whitespace())
            .take_while(|c| c.is_alphabetic())
            .collect::<String>()
    });
    let unit = unit.filter(|u| !u.is_empty());

    (value, unit)
}

/// Turn one raw item into a canonical `Record`. Returns `None` when neither
/// URL survives normalization: a record with no identity is unusable and is
/// dropped rather than propagated.
pub fn build_record(raw: &RawItem, base: &Url) -> Option<Record> {
    let image_url = raw
        .get("image")
        .and_then(|v| normalize_url(v, base))
        .unwrap_or_default();
    let detail_url = raw
        .get("url")
        .and_then(|v| normalize_url(v, base))
        .unwrap_or_default();
    if image_url.is_empty() && detail_url.is_empty() {
        return None;
    }

    let (value, inferred_unit) = raw
        .get("value")
        .map(|v| split_value(v))
        .unwrap_or((None, None));
    let unit = raw
        .get("unit")
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .or(inferred_unit);

    let title = raw
        .get("title")
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| UNTITLED_PLACEHOLDER.to_string());

    let extra = raw
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "title" | "image" | "url" | "value" | "unit"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<BTreeMap<_, _>>();

    Some(Record {
        title,
        image_url,
        detail_url,
        value,
        unit,
        extra,
    })
}

/// Apply a profile's CSS field map to a document: one `RawItem` per match of
/// the item selector, fields resolved inside that element. Used by fetch
/// sessions and by browser sessions extracting from the rendered source.
pub fn extract_items(
    html: &str,
    item_selector: &str,
    fields: &BTreeMap<String, FieldRule>,
) -> Result<Vec<RawItem>, String> {
    let item_sel =
        Selector::parse(item_selector).map_err(|e| format!("bad item selector: {e}"))?;
    let mut field_sels = Vec::new();
    for (name, rule) in fields {
        let sel = match &rule.selector {
            Some(s) => {
                Some(Selector::parse(s).map_err(|e| format!("bad selector for {name}: {e}"))?)
            }
            None => None,
        };
        field_sels.push((name.as_str(), sel, rule.attr.as_deref()));
    }

    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    for element in doc.select(&item_sel) {
        let mut item = RawItem::new();
        for (name, sel, attr) in &field_sels {
            let target = match sel {
                Some(sel) => element.select(sel).next(),
                None => Some(element),
            };
            let Some(target) = target else { continue };
            let value = match attr {
                Some(attr) => target.value().attr(attr).unwrap_or("").to_string(),
                None => target.text().collect::<Vec<_>>().join(" "),
            };
            let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
            if !value.is_empty() {
                item.insert((*name).to_string(), value);
            }
        }
        out.push(item);
    }
    Ok(out)
}

/// Resolve one field rule against a whole document; used by detail-page
/// visits where there is no repeating item element.
pub fn extract_field(html: &str, rule: &FieldRule) -> Option<String> {
    let selector = rule.selector.as_deref()?;
    let sel = Selector::parse(selector).ok()?;
    let doc = Html::parse_document(html);
    let element = doc.select(&sel).next()?;
    let value = match rule.attr.as_deref() {
        Some(attr) => element.value().attr(attr).unwrap_or("").to_string(),
        None => element.text().collect::<Vec<_>>().join(" "),
    };
    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if value.is_empty() { None } else { Some(value) }
}

/// Count matches of a selector in a document; used by readiness checks and
/// scroll settling on fetch sessions.
pub fn count_matches(html: &str, selector: &str) -> Result<usize, String> {
    let sel = Selector::parse(selector).map_err(|e| format!("bad selector: {e}"))?;
    Ok(Html::parse_document(html).select(&sel).count())
}
