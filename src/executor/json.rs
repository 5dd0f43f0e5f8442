use futures::StreamExt;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::store::{Row, RowStream};
use crate::template::DirectiveParamList;

use super::QueryOutput;

/// Drains at most `limit` rows (0 = all) into a JSON array of objects. With
/// `keep` set, only columns named in it are emitted.
pub(crate) async fn rows_to_json(
    mut rows: RowStream<'_>,
    limit: usize,
    keep: Option<&DirectiveParamList>,
) -> Result<QueryOutput> {
    let mut out = Vec::new();

    while limit == 0 || out.len() < limit {
        let Some(row) = rows.next().await else {
            break;
        };
        out.push(Value::Object(row_to_object(row?, keep)));
    }

    let count = out.len();
    let json = serde_json::to_vec(&Value::Array(out))?;
    Ok(QueryOutput { json, rows: count })
}

fn row_to_object(row: Row, keep: Option<&DirectiveParamList>) -> Map<String, Value> {
    row.into_iter()
        .filter(|(column, _)| keep.map_or(true, |list| list.contains(column)))
        .collect()
}
