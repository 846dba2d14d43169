//! Page Walker
//!
//! Follows `@odata.nextLink` continuation links until a collection is
//! exhausted, and surfaces the terminal `@odata.deltaLink` when the endpoint
//! supports incremental re-sync. A walk can be restarted from any saved
//! continuation link.

use super::client::ApiClient;
use crate::error::ApiError;
use futures::stream::{self, Stream};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

const NEXT_LINK: &str = "@odata.nextLink";
const DELTA_LINK: &str = "@odata.deltaLink";
const REMOVED: &str = "@removed";

/// One decoded page of a collection response
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_link: Option<String>,
    pub delta_link: Option<String>,
}

impl Page {
    pub fn from_value(value: Value) -> Result<Self, ApiError> {
        let Value::Object(mut map) = value else {
            return Err(ApiError::Decode("collection response is not an object".into()));
        };

        let items = match map.remove("value") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(_) => return Err(ApiError::Decode("`value` is not an array".into())),
        };

        let link = |map: &serde_json::Map<String, Value>, key: &str| {
            map.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
        };

        Ok(Self {
            next_link: link(&map, NEXT_LINK),
            delta_link: link(&map, DELTA_LINK),
            items,
        })
    }
}

/// Every item of a walk plus the delta link it ended on, if any
#[derive(Debug, Clone, Default)]
pub struct PageSet {
    pub items: Vec<Value>,
    pub delta_link: Option<String>,
}

/// Lazy walker over a paged collection
pub struct PageWalker<'a> {
    client: &'a ApiClient,
    next: Option<String>,
    delta_link: Option<String>,
    pages: u32,
}

impl<'a> PageWalker<'a> {
    pub fn new(client: &'a ApiClient, initial: &str) -> Self {
        Self {
            client,
            next: Some(initial.to_string()),
            delta_link: None,
            pages: 0,
        }
    }

    /// Restart a walk from a previously saved continuation link
    pub fn resume(client: &'a ApiClient, continuation: &str) -> Self {
        Self::new(client, continuation)
    }

    /// Link of the next page still to be fetched
    pub fn continuation(&self) -> Option<&str> {
        self.next.as_deref()
    }

    pub fn delta_link(&self) -> Option<&str> {
        self.delta_link.as_deref()
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages
    }

    /// Fetch the next page, or `None` once the collection is exhausted
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, ApiError> {
        let Some(link) = self.next.take() else {
            return Ok(None);
        };

        let page = match self.client.get(&link).await {
            Ok(value) => Page::from_value(value)?,
            Err(err) => {
                // keep the link so the caller can resume from here
                self.next = Some(link);
                return Err(err);
            }
        };

        self.pages += 1;
        self.next = page.next_link;
        if page.delta_link.is_some() {
            self.delta_link = page.delta_link;
        }
        Ok(Some(page.items))
    }

    /// Materialize the whole collection
    pub async fn collect_all(mut self) -> Result<PageSet, ApiError> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page);
        }
        tracing::debug!("Collected {} items over {} pages", items.len(), self.pages);
        Ok(PageSet {
            items,
            delta_link: self.delta_link,
        })
    }

    /// Items as a lazy stream, fetching pages on demand
    pub fn into_stream(self) -> impl Stream<Item = Result<Value, ApiError>> + 'a {
        stream::try_unfold(
            (self, VecDeque::new()),
            |(mut walker, mut buffer)| async move {
                loop {
                    if let Some(item) = buffer.pop_front() {
                        return Ok(Some((item, (walker, buffer))));
                    }
                    match walker.next_page().await {
                        Ok(Some(items)) => buffer.extend(items),
                        Ok(None) => return Ok(None),
                        Err(err) => return Err(err),
                    }
                }
            },
        )
    }
}

/// Collect a collection whose first page was already obtained elsewhere
/// (for instance as a batch sub-response)
pub async fn collect_from_first(client: &ApiClient, first: Value) -> Result<PageSet, ApiError> {
    let page = Page::from_value(first)?;
    let mut items = page.items;
    let mut delta_link = page.delta_link;

    if let Some(next) = page.next_link {
        let rest = PageWalker::resume(client, &next).collect_all().await?;
        items.extend(rest.items);
        delta_link = rest.delta_link.or(delta_link);
    }

    Ok(PageSet { items, delta_link })
}

/// One change reported by a delta walk
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaEntry {
    /// Created or updated entity
    Upsert(Value),
    /// Deleted entity, identified by id
    Tombstone(String),
}

impl DeltaEntry {
    /// Classify a delta item; items without an id are dropped
    pub fn from_item(item: Value) -> Option<Self> {
        let id = item.get("id").and_then(|v| v.as_str())?.to_string();
        if item.get(REMOVED).is_some() {
            Some(DeltaEntry::Tombstone(id))
        } else {
            Some(DeltaEntry::Upsert(item))
        }
    }
}

/// Changes since a delta link, plus the link to use next time
#[derive(Debug, Clone, Default)]
pub struct DeltaSet {
    pub entries: Vec<DeltaEntry>,
    pub delta_link: Option<String>,
}

/// Walk a saved delta link and return only what changed since it was issued
pub async fn walk_delta(client: &ApiClient, delta_link: &str) -> Result<DeltaSet, ApiError> {
    let set = PageWalker::resume(client, delta_link).collect_all().await?;
    Ok(DeltaSet {
        entries: set.items.into_iter().filter_map(DeltaEntry::from_item).collect(),
        delta_link: set.delta_link,
    })
}

/// Apply delta entries to a working set: tombstones remove, upserts replace.
/// Upserts `decode` rejects are ignored.
pub fn fold_delta<T, I, F>(working: &mut HashMap<String, T>, entries: I, decode: F)
where
    I: IntoIterator<Item = DeltaEntry>,
    F: Fn(&Value) -> Option<T>,
{
    for entry in entries {
        match entry {
            DeltaEntry::Tombstone(id) => {
                working.remove(&id);
            }
            DeltaEntry::Upsert(item) => {
                let id = item.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());
                if let (Some(id), Some(value)) = (id, decode(&item)) {
                    working.insert(id, value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_from_value() {
        let page = Page::from_value(json!({
            "value": [{"id": "1"}, {"id": "2"}],
            "@odata.nextLink": "https://api/next"
        }))
        .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_link.as_deref(), Some("https://api/next"));
        assert!(page.delta_link.is_none());
    }

    #[test]
    fn test_page_without_value_is_empty() {
        let page = Page::from_value(json!({"@odata.deltaLink": "d"})).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.delta_link.as_deref(), Some("d"));
        assert!(Page::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_delta_entry_classification() {
        assert_eq!(
            DeltaEntry::from_item(json!({"id": "a", "@removed": {"reason": "deleted"}})),
            Some(DeltaEntry::Tombstone("a".into()))
        );
        assert!(matches!(
            DeltaEntry::from_item(json!({"id": "b", "name": "x"})),
            Some(DeltaEntry::Upsert(_))
        ));
        assert_eq!(DeltaEntry::from_item(json!({"name": "no id"})), None);
    }

    #[test]
    fn test_fold_delta() {
        let mut working: HashMap<String, String> = HashMap::new();
        working.insert("a".into(), "old-a".into());
        working.insert("b".into(), "old-b".into());

        let entries = vec![
            DeltaEntry::Tombstone("a".into()),
            DeltaEntry::Upsert(json!({"id": "b", "name": "new-b"})),
            DeltaEntry::Upsert(json!({"id": "c", "name": "new-c"})),
        ];
        fold_delta(&mut working, entries, |v| {
            v.get("name").and_then(|n| n.as_str()).map(String::from)
        });

        assert!(!working.contains_key("a"));
        assert_eq!(working["b"], "new-b");
        assert_eq!(working["c"], "new-c");
    }
}
