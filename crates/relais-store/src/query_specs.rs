use relais_shared::models::query_key;
use relais_shared::{FilterObject, QuerySort, QuerySpec};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_query_spec(&self, spec: &QuerySpec) -> Result<()> {
        let doc = serde_json::to_string(spec)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO query_specs (query_key, doc) VALUES (?1, ?2)",
            params![spec.key(), doc],
        )?;
        Ok(())
    }

    pub fn get_query_spec(&self, filter: &FilterObject, sort: &QuerySort) -> Result<Option<QuerySpec>> {
        let doc: Option<String> = self
            .conn()
            .query_row(
                "SELECT doc FROM query_specs WHERE query_key = ?1",
                params![query_key(filter, sort)],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| serde_json::from_str(&d).map_err(Into::into))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_is_keyed_by_filter_and_sort() {
        let db = Database::open_in_memory().unwrap();
        let filter = FilterObject::contains("members", "alice");
        let mut spec = QuerySpec::new(filter.clone(), QuerySort::by_last_message());
        spec.add_cids(["messaging:a", "messaging:b"]);
        db.upsert_query_spec(&spec).unwrap();

        let stored = db
            .get_query_spec(&filter, &QuerySort::by_last_message())
            .unwrap()
            .unwrap();
        assert_eq!(stored.cids, spec.cids);

        let other_sort = QuerySort::default().asc("name");
        assert!(db.get_query_spec(&filter, &other_sort).unwrap().is_none());
    }
}
