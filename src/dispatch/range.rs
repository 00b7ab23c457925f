//! Host range expansion for `mesh send` and `vm launch`.
//!
//! Syntax: comma-separated items; each item is either a single name or a
//! `prefix[lo-hi,n,...]suffix` range. Commas inside brackets belong to the
//! range; nested brackets are not supported. Numeric items with leading
//! zeros keep their width (`n[01-03]` → `n01 n02 n03`).

use crate::error::{Error, Result};

/// Expand one range specification into an ordered list of names.
pub fn expand(spec: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for item in split_items(spec)? {
        if item.is_empty() {
            continue;
        }
        names.extend(expand_item(&item)?);
    }
    Ok(names)
}

/// Split on commas outside brackets.
fn split_items(spec: &str) -> Result<Vec<String>> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut depth = 0u32;

    for c in spec.chars() {
        match c {
            '[' => {
                depth += 1;
                if depth > 1 {
                    return Err(Error::Invalid(format!(
                        "nested brackets in range: {:?}",
                        spec
                    )));
                }
                current.push(c);
            }
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::Invalid(format!("unbalanced brackets: {:?}", spec)))?;
                current.push(c);
            }
            ',' if depth == 0 => items.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if depth != 0 {
        return Err(Error::Invalid(format!("unbalanced brackets: {:?}", spec)));
    }
    items.push(current);
    Ok(items)
}

fn expand_item(item: &str) -> Result<Vec<String>> {
    let Some(open) = item.find('[') else {
        return Ok(vec![item.to_string()]);
    };
    let close = item
        .find(']')
        .ok_or_else(|| Error::Invalid(format!("unbalanced brackets: {:?}", item)))?;
    if close < open {
        return Err(Error::Invalid(format!("unbalanced brackets: {:?}", item)));
    }

    let prefix = &item[..open];
    let body = &item[open + 1..close];
    let suffix = &item[close + 1..];
    if suffix.contains('[') {
        return Err(Error::Invalid(format!("nested brackets in {:?}", item)));
    }

    let mut names = Vec::new();
    for part in body.split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                let low: u64 = lo
                    .parse()
                    .map_err(|_| Error::Invalid(format!("bad range bound: {:?}", lo)))?;
                let high: u64 = hi
                    .parse()
                    .map_err(|_| Error::Invalid(format!("bad range bound: {:?}", hi)))?;
                if low > high {
                    return Err(Error::Invalid(format!("inverted range: {:?}", part)));
                }
                // Preserve zero padding when the bound was written padded.
                let width = if lo.starts_with('0') && lo.len() > 1 {
                    lo.len()
                } else {
                    0
                };
                for n in low..=high {
                    names.push(format!("{}{:0width$}{}", prefix, n, suffix, width = width));
                }
            }
            None => names.push(format!("{}{}{}", prefix, part, suffix)),
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_name() {
        assert_eq!(expand("a").unwrap(), vec!["a"]);
    }

    #[test]
    fn trailing_comma_ignored() {
        assert_eq!(expand("a,").unwrap(), vec!["a"]);
    }

    #[test]
    fn plain_list() {
        assert_eq!(expand("foo,bar").unwrap(), vec!["foo", "bar"]);
    }

    #[test]
    fn list_with_range() {
        assert_eq!(expand("foo,bar[0-1]").unwrap(), vec!["foo", "bar0", "bar1"]);
    }

    #[test]
    fn mixed_ranges_preserve_order_and_count() {
        let names = expand("foo,bar[0-1],kn[1,2,3]").unwrap();
        assert_eq!(names.len(), 6);
        assert_eq!(names, vec!["foo", "bar0", "bar1", "kn1", "kn2", "kn3"]);
    }

    #[test]
    fn padded_bounds_keep_width() {
        assert_eq!(expand("n[08-10]").unwrap(), vec!["n08", "n09", "n10"]);
    }

    #[test]
    fn suffix_after_bracket() {
        assert_eq!(
            expand("rack[1-2]-node").unwrap(),
            vec!["rack1-node", "rack2-node"]
        );
    }

    #[test]
    fn errors() {
        assert!(expand("a[0-1[2]]").is_err());
        assert!(expand("a[0-1").is_err());
        assert!(expand("a[b-c]").is_err());
        assert!(expand("a[5-2]").is_err());
    }
}
