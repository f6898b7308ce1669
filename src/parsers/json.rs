use super::{checkpoint, lookup, report_skipped, FieldMapper, FormatParser, ParseContext};
use crate::{
    error::{RepoError, RepoResult},
    fetcher::RawPayload,
    package::Package,
};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// JSON documents holding a list of records, or a single record.
///
/// `parsing.root_path` points at the records. Without it the document itself
/// is used: an array is a record list, an object is either one record or a
/// map of package name to record.
pub struct JsonParser;

const DEFAULT_FIELDS: &[(&str, &str)] = &[];

fn records(document: &Value, root_path: Option<&str>, name_key: &str) -> RepoResult<Vec<Option<Map<String, Value>>>> {
    let root = match root_path {
        Some(path) => {
            let Value::Object(top) = document else {
                return Err(RepoError::ParseError(format!(
                    "expected an object to resolve '{}'",
                    path
                )));
            };
            lookup(top, path).ok_or_else(|| {
                RepoError::ParseError(format!("root path '{}' not found in document", path))
            })?
        }
        None => document,
    };

    match root {
        Value::Array(items) => Ok(items
            .iter()
            .map(|item| item.as_object().cloned())
            .collect()),
        Value::Object(map) if root_path.is_some() || lookup(map, name_key).is_some() => {
            Ok(vec![Some(map.clone())])
        }
        Value::Object(map) => Ok(map
            .iter()
            .map(|(key, value)| {
                value.as_object().map(|record| {
                    let mut record = record.clone();
                    record
                        .entry(name_key.to_string())
                        .or_insert_with(|| Value::String(key.clone()));
                    record
                })
            })
            .collect()),
        other => Err(RepoError::ParseError(format!(
            "expected a JSON array or object of records, got {}",
            kind(other)
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl FormatParser for JsonParser {
    fn format(&self) -> &'static str {
        "json"
    }

    async fn parse(&self, payload: &RawPayload, ctx: &ParseContext<'_>) -> RepoResult<Vec<Package>> {
        let data = ctx.decompressor.decode(&payload.bytes, &payload.url).await?;
        let document: Value = serde_json::from_slice(&data)?;

        let mapper = FieldMapper::new(ctx, DEFAULT_FIELDS);
        let records = records(
            &document,
            ctx.parsing().root_path.as_deref(),
            mapper.source("name"),
        )?;

        let mut packages = Vec::with_capacity(records.len());
        let mut skipped = 0;
        for (index, record) in records.into_iter().enumerate() {
            checkpoint(index).await;
            match record.as_ref().and_then(|r| mapper.map(r)) {
                Some(package) => packages.push(package),
                None => skipped += 1,
            }
        }

        report_skipped(self.format(), &ctx.repository.name, packages.len(), skipped);
        Ok(packages)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::compression::Decompressor;
    use serde_json::json;

    async fn parse(
        body: Value,
        root_path: Option<&str>,
        fields: &[(&str, &str)],
    ) -> RepoResult<Vec<Package>> {
        let mut repo = repository("json", fields);
        repo.parsing.root_path = root_path.map(|s| s.to_string());
        let docs = StaticDocuments::default();
        let ctx = ParseContext::new(&repo, Decompressor::new(1 << 20), &docs);
        let payload = RawPayload::new("https://api.example/packages", body.to_string().into_bytes());
        JsonParser.parse(&payload, &ctx).await
    }

    #[tokio::test]
    async fn test_npm_search_shape() {
        let body = json!({
            "objects": [
                {"package": {"name": "left-pad", "version": "1.3.0", "description": "String left pad",
                             "keywords": ["pad", "string"], "date": "2018-04-09T01:34:03.000Z"}},
                {"package": {"name": "leftpad", "version": "0.0.1"}},
                {"package": {"version": "0.0.2"}}
            ],
            "total": 3
        });
        let fields = [
            ("name", "package.name"),
            ("version", "package.version"),
            ("description", "package.description"),
            ("tags", "package.keywords"),
            ("last_updated", "package.date"),
        ];
        let packages = parse(body, Some("objects"), &fields).await.unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].tags.as_ref().unwrap(), &vec!["pad".to_string(), "string".to_string()]);
        assert!(packages[0].last_updated.is_some());
        assert_eq!(packages[0].repository_name, "test-json");
    }

    #[tokio::test]
    async fn test_single_record_under_root_path() {
        let body = json!({"info": {"name": "requests", "version": "2.31.0", "summary": "HTTP for Humans."}});
        let packages = parse(body, Some("info"), &[("description", "summary")]).await.unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].description.as_deref(), Some("HTTP for Humans."));
    }

    #[tokio::test]
    async fn test_top_level_array_with_nested_version() {
        let body = json!([
            {"name": "wget", "versions": {"stable": "1.24.5"}, "desc": "Internet file retriever"},
            {"name": "jq", "versions": {"stable": "1.7.1"}},
            "not a record"
        ]);
        let packages = parse(body, None, &[("version", "versions.stable")]).await.unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[1].version, "1.7.1");
    }

    #[tokio::test]
    async fn test_object_keyed_by_name() {
        let body = json!({
            "ripgrep": {"version": "14.1.0"},
            "fd": {"version": "9.0.0"}
        });
        let mut names: Vec<String> = parse(body, None, &[])
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["fd", "ripgrep"]);
    }

    #[tokio::test]
    async fn test_structural_errors() {
        let repo = repository("json", &[]);
        let docs = StaticDocuments::default();
        let ctx = ParseContext::new(&repo, Decompressor::new(1 << 20), &docs);
        let payload = RawPayload::new("https://api.example/packages", b"{\"truncated\": [".to_vec());
        assert!(JsonParser.parse(&payload, &ctx).await.unwrap_err().is_parse_failure());

        assert!(parse(json!("just a string"), None, &[]).await.is_err());
        assert!(parse(json!({"data": []}), Some("results"), &[]).await.is_err());
    }
}
