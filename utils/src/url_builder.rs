use url::{ParseError, Url};

/// Join `endpoint` onto `base` and append `params` as query pairs.
///
/// `endpoint` may also be an absolute URL, in which case `base` is ignored.
pub fn build_url<'a, I>(base: &Url, endpoint: &str, params: I) -> Result<Url, ParseError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut url = base.join(endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        for (name, value) in params {
            query.append_pair(name, value);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}
