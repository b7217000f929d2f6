//! Request path parsing.
//!
//! Paths come in path-style form, optionally prefixed with the account name:
//!
//! ```text
//! /Tables                                   table collection
//! /Tables('name')                           one table
//! /name  or  /name()                        entities of a table
//! /name(PartitionKey='p',RowKey='r')        one entity
//! /$batch  or  /name/$batch                 entity group transaction
//! ```

use tablelocal_common::{EntityKey, Error, Result, TableName};

/// Path segment naming the table collection
pub const TABLES_SEGMENT: &str = "Tables";

/// Path segment of the batch endpoint
pub const BATCH_SEGMENT: &str = "$batch";

/// Resource addressed by a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Tables,
    Table(TableName),
    Entities(TableName),
    Entity(TableName, EntityKey),
    Batch,
}

impl Resource {
    /// Table the resource belongs to, if any
    #[must_use]
    pub const fn table(&self) -> Option<&TableName> {
        match self {
            Self::Table(name) | Self::Entities(name) | Self::Entity(name, _) => Some(name),
            Self::Tables | Self::Batch => None,
        }
    }
}

/// Parse a raw (percent-encoded) request path
pub fn parse_path(path: &str, account: &str) -> Result<Resource> {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() > 1 && segments[0] == account {
        segments.remove(0);
    }

    match segments.as_slice() {
        [segment] => parse_segment(&decode(segment)?),
        [_table, batch] if *batch == BATCH_SEGMENT => Ok(Resource::Batch),
        [] => Err(Error::InvalidUri("no resource in request path".into())),
        _ => Err(Error::InvalidUri(format!("unrecognized resource path: {path}"))),
    }
}

/// Strip scheme and authority from an absolute URL, keeping path and query
#[must_use]
pub fn path_and_query(url: &str) -> &str {
    match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            rest.find('/').map_or("/", |slash| &rest[slash..])
        }
        None => url,
    }
}

fn decode(segment: &str) -> Result<String> {
    urlencoding::decode(segment)
        .map(std::borrow::Cow::into_owned)
        .map_err(|_| Error::InvalidUri(format!("invalid percent-encoding in {segment}")))
}

fn parse_segment(segment: &str) -> Result<Resource> {
    if segment == BATCH_SEGMENT {
        return Ok(Resource::Batch);
    }

    let (name, args) = match segment.find('(') {
        None => (segment, None),
        Some(open) => {
            let Some(inner) = segment[open + 1..].strip_suffix(')') else {
                return Err(Error::InvalidUri(format!("unbalanced parentheses: {segment}")));
            };
            (&segment[..open], Some(inner))
        }
    };

    if name.eq_ignore_ascii_case(TABLES_SEGMENT) {
        return match args {
            None | Some("") => Ok(Resource::Tables),
            Some(args) => {
                let mut parser = ArgParser::new(args);
                let table = parser.quoted()?;
                parser.finish()?;
                Ok(Resource::Table(TableName::new(table)?))
            }
        };
    }

    let table = TableName::new(name)?;
    match args {
        None | Some("") => Ok(Resource::Entities(table)),
        Some(args) => {
            let key = parse_key_predicate(args)?;
            Ok(Resource::Entity(table, key))
        }
    }
}

/// Parse `PartitionKey='..',RowKey='..'` (either order)
fn parse_key_predicate(args: &str) -> Result<EntityKey> {
    let mut parser = ArgParser::new(args);
    let mut partition_key = None;
    let mut row_key = None;
    loop {
        let name = parser.ident();
        parser.expect('=')?;
        let value = parser.quoted()?;
        match name {
            "PartitionKey" if partition_key.is_none() => partition_key = Some(value),
            "RowKey" if row_key.is_none() => row_key = Some(value),
            other => {
                return Err(Error::InvalidUri(format!(
                    "unexpected key predicate component: {other}"
                )));
            }
        }
        if parser.at_end() {
            break;
        }
        parser.expect(',')?;
    }

    match (partition_key, row_key) {
        (Some(pk), Some(rk)) => Ok(EntityKey::new(pk, rk)?),
        _ => Err(Error::InvalidUri(
            "key predicate must name both PartitionKey and RowKey".into(),
        )),
    }
}

struct ArgParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> ArgParser<'a> {
    const fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn ident(&mut self) -> &'a str {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn expect(&mut self, ch: char) -> Result<()> {
        if self.rest().starts_with(ch) {
            self.pos += ch.len_utf8();
            Ok(())
        } else {
            Err(Error::InvalidUri(format!(
                "expected '{ch}' at position {} of ({})",
                self.pos, self.src
            )))
        }
    }

    /// A single-quoted string; `''` inside stands for one quote
    fn quoted(&mut self) -> Result<String> {
        self.expect('\'')?;
        let mut out = String::new();
        loop {
            let rest = self.rest();
            let Some(idx) = rest.find('\'') else {
                return Err(Error::InvalidUri(format!(
                    "unterminated string in ({})",
                    self.src
                )));
            };
            out.push_str(&rest[..idx]);
            self.pos += idx + 1;
            if self.rest().starts_with('\'') {
                out.push('\'');
                self.pos += 1;
            } else {
                return Ok(out);
            }
        }
    }

    fn finish(&self) -> Result<()> {
        if self.at_end() {
            Ok(())
        } else {
            Err(Error::InvalidUri(format!(
                "unexpected trailing input in ({})",
                self.src
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = "devstoreaccount1";

    fn table(name: &str) -> TableName {
        TableName::new(name).unwrap()
    }

    #[test]
    fn test_tables_paths() {
        assert_eq!(parse_path("/Tables", ACCOUNT).unwrap(), Resource::Tables);
        assert_eq!(
            parse_path("/devstoreaccount1/Tables", ACCOUNT).unwrap(),
            Resource::Tables
        );
        assert_eq!(
            parse_path("/devstoreaccount1/Tables('test')", ACCOUNT).unwrap(),
            Resource::Table(table("test"))
        );
        assert_eq!(
            parse_path("/Tables(%27test%27)", ACCOUNT).unwrap(),
            Resource::Table(table("test"))
        );
    }

    #[test]
    fn test_entity_paths() {
        assert_eq!(
            parse_path("/devstoreaccount1/test()", ACCOUNT).unwrap(),
            Resource::Entities(table("test"))
        );
        assert_eq!(
            parse_path("/test", ACCOUNT).unwrap(),
            Resource::Entities(table("test"))
        );
        assert_eq!(
            parse_path(
                "/devstoreaccount1/test(PartitionKey='PK',RowKey='RK')",
                ACCOUNT
            )
            .unwrap(),
            Resource::Entity(table("test"), EntityKey::new("PK", "RK").unwrap())
        );
    }

    #[test]
    fn test_key_predicate_escaping() {
        let resource = parse_path(
            "/test(RowKey='it%27%27s%2C%20here',PartitionKey='a%20b')",
            ACCOUNT,
        )
        .unwrap();
        assert_eq!(
            resource,
            Resource::Entity(table("test"), EntityKey::new("a b", "it's, here").unwrap())
        );

        let resource = parse_path("/test(PartitionKey='',RowKey='')", ACCOUNT).unwrap();
        assert_eq!(
            resource,
            Resource::Entity(table("test"), EntityKey::new("", "").unwrap())
        );
    }

    #[test]
    fn test_batch_paths() {
        assert_eq!(parse_path("/$batch", ACCOUNT).unwrap(), Resource::Batch);
        assert_eq!(
            parse_path("/devstoreaccount1/$batch", ACCOUNT).unwrap(),
            Resource::Batch
        );
        assert_eq!(
            parse_path("/devstoreaccount1/test/$batch", ACCOUNT).unwrap(),
            Resource::Batch
        );
    }

    #[test]
    fn test_invalid_paths() {
        assert!(parse_path("/", ACCOUNT).is_err());
        assert!(parse_path("/test(PartitionKey='a')", ACCOUNT).is_err());
        assert!(parse_path("/test(PartitionKey='a',RowKey='b'", ACCOUNT).is_err());
        assert!(parse_path("/test(Foo='a',RowKey='b')", ACCOUNT).is_err());
        assert!(matches!(
            parse_path("/ab", ACCOUNT),
            Err(Error::InvalidTableName(_))
        ));
        assert!(matches!(
            parse_path("/test(PartitionKey='a%2Fb',RowKey='b')", ACCOUNT),
            Err(Error::InvalidKey(_))
        ));
        assert!(parse_path("/a/b/c", ACCOUNT).is_err());
    }

    #[test]
    fn test_path_and_query() {
        assert_eq!(
            path_and_query("http://127.0.0.1:10002/devstoreaccount1/test?$top=1"),
            "/devstoreaccount1/test?$top=1"
        );
        assert_eq!(path_and_query("/test"), "/test");
        assert_eq!(path_and_query("http://host"), "/");
    }
}
