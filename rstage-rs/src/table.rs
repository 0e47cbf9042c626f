//! Table bindings: repeating row elements ⇄ a `data.frame`.
//!
//! Each row element the table path selects becomes one frame row; each
//! column path, evaluated with the row element as context, supplies or
//! receives that row's cell.

use tracing::trace;

use crate::binding::{ColumnBinding, TableBinding};
use crate::coerce::{scalar_at, VectorBuilder};
use crate::error::{code, kind_index, BindingError, Fault, NodeError, Site};
use crate::path::PathValue;
use crate::session::RemoteSession;
use crate::tree::{Message, NodeId};
use crate::value::RValue;

// ── Push ──────────────────────────────────────────────────────────────────────

fn push_error(owner: &str, table: &TableBinding, path: &str, fault: Fault) -> BindingError {
    BindingError::new(Site::TablePush, owner, &table.name, path, fault)
}

fn build_column(
    owner: &str,
    table: &TableBinding,
    column: &ColumnBinding,
    msg: &Message,
    rows: &[NodeId],
) -> Result<RValue, BindingError> {
    let fail = |fault| push_error(owner, table, column.path.source(), fault);
    let mut builder = VectorBuilder::new(column.kind, rows.len());
    for (r, &row) in rows.iter().enumerate() {
        match column.path.evaluate(msg, Some(row)).map_err(|e| fail(Fault::Path(e)))? {
            PathValue::Nodes(cells) if cells.len() > 1 => {
                return Err(fail(Fault::MultipleNodes { row: r + 1, column: column.name.clone() })
                    .at(msg.tree.display_path(row)));
            }
            PathValue::Nodes(cells) => {
                let cell = cells.first().copied();
                builder.push(cell.and_then(|c| msg.tree.value(c))).map_err(|e| {
                    let err = fail(Fault::Convert { kind: e.kind, value: e.value, from_element: true });
                    err.at(msg.tree.display_path(cell.unwrap_or(row)))
                })?;
            }
            PathValue::Scalar(value) => {
                builder.push(Some(&value)).map_err(|e| {
                    fail(Fault::Convert { kind: e.kind, value: e.value, from_element: false })
                        .at(msg.tree.display_path(row))
                })?;
            }
        }
    }
    Ok(builder.finish())
}

/// Build the data frame a table binding sends to the interpreter, from its
/// IN and INOUT columns in declaration order.
pub fn build_frame(owner: &str, table: &TableBinding, msg: &Message) -> Result<RValue, BindingError> {
    let rows = match table.path.evaluate(msg, None) {
        Ok(PathValue::Nodes(rows)) => rows,
        Ok(PathValue::Scalar(_)) => {
            return Err(push_error(owner, table, table.path.source(), Fault::NotNodeset))
        }
        Err(e) => return Err(push_error(owner, table, table.path.source(), Fault::Path(e))),
    };
    if rows.is_empty() {
        return Err(push_error(owner, table, table.path.source(), Fault::EmptyNodeset));
    }

    let mut columns = Vec::new();
    for column in table.in_columns() {
        let vector = build_column(owner, table, column, msg, &rows)?;
        trace!(
            code = code::TABLE_ASSIGN[kind_index(column.kind)],
            node = owner,
            table = %table.name,
            column = %column.name,
            rows = rows.len(),
            "assigning column"
        );
        columns.push((column.name.clone(), vector));
    }
    Ok(RValue::data_frame(columns))
}

/// Assign the table's data frame in the session.
pub async fn push(
    owner: &str,
    table: &TableBinding,
    msg: &Message,
    session: &mut RemoteSession,
) -> Result<(), NodeError> {
    let frame = build_frame(owner, table, msg)?;
    session
        .interpreter()
        .assign(&table.name, &frame)
        .await
        .map_err(|e| NodeError::remote(owner, e))
}

// ── Pull ──────────────────────────────────────────────────────────────────────

fn pull_error(owner: &str, table: &TableBinding, path: &str, fault: Fault) -> BindingError {
    BindingError::new(Site::TablePull, owner, &table.name, path, fault)
}

/// Write the OUT and INOUT columns of `frame` into the rows the table
/// selects in `msg`.
///
/// Row elements are added after the last one until there are at least as
/// many as frame rows; surplus row elements receive the last frame row.
pub fn apply_frame(
    owner: &str,
    table: &TableBinding,
    msg: &mut Message,
    frame: &RValue,
) -> Result<(), BindingError> {
    let table_path = table.path.source();
    if !frame.is_data_frame() {
        return Err(pull_error(owner, table, table_path, Fault::NotDataFrame { found: frame.type_name() }));
    }

    let mut columns = Vec::new();
    for column in table.out_columns() {
        let data = frame.column(&column.name).ok_or_else(|| {
            pull_error(owner, table, table_path, Fault::MissingColumn { column: column.name.clone() })
        })?;
        let kind = data.kind().ok_or_else(|| {
            pull_error(
                owner,
                table,
                table_path,
                Fault::UnsupportedType { found: data.type_name(), column: Some(column.name.clone()) },
            )
        })?;
        columns.push((column, data, kind));
    }
    let Some(row_count) = columns.first().map(|(_, data, _)| data.len()) else {
        return Ok(());
    };

    let mut rows = match table.path.evaluate_mut(msg, None) {
        Ok(PathValue::Nodes(rows)) => rows,
        Ok(PathValue::Scalar(_)) => return Err(pull_error(owner, table, table_path, Fault::NotNodeset)),
        Err(e) => return Err(pull_error(owner, table, table_path, Fault::Path(e))),
    };
    if rows.is_empty() {
        return Err(pull_error(owner, table, table_path, Fault::EmptyNodeset));
    }
    while rows.len() < row_count {
        let last = rows[rows.len() - 1];
        let created = msg
            .tree
            .create_sibling_after(last)
            .map_err(|e| pull_error(owner, table, table_path, Fault::Tree(e.to_string())))?;
        trace!(code = code::NEW_ELEMENT, node = owner, element = %msg.tree.display_path(created), "created row element");
        rows.push(created);
    }

    for (r, &row) in rows.iter().enumerate() {
        // Surplus rows repeat the last frame row.
        let source_row = row_count.checked_sub(1).map(|last| r.min(last));
        for (column, data, kind) in &columns {
            let fail = |fault| pull_error(owner, table, column.path.source(), fault);
            let cells = match column.path.evaluate_mut(msg, Some(row)).map_err(|e| fail(Fault::Path(e)))? {
                PathValue::Nodes(cells) => cells,
                PathValue::Scalar(_) => {
                    return Err(fail(Fault::ColumnNotNodeset { row: r + 1, column: column.name.clone() })
                        .at(msg.tree.display_path(row)))
                }
            };
            let cell = match cells.as_slice() {
                [cell] => *cell,
                [] => {
                    return Err(fail(Fault::NoNode { row: r + 1, column: column.name.clone() })
                        .at(msg.tree.display_path(row)))
                }
                _ => {
                    return Err(fail(Fault::MultipleNodes { row: r + 1, column: column.name.clone() })
                        .at(msg.tree.display_path(row)))
                }
            };
            let value = source_row.and_then(|i| scalar_at(data, i));
            trace!(
                code = code::TABLE_FETCH[kind_index(*kind)],
                node = owner,
                table = %table.name,
                column = %column.name,
                element = %msg.tree.display_path(cell),
                value = ?value,
                "assigning cell"
            );
            msg.tree.set_value(cell, value);
        }
    }
    Ok(())
}

/// Fetch the table's data frame from the session and write it into `msg`.
pub async fn pull(
    owner: &str,
    table: &TableBinding,
    msg: &mut Message,
    session: &mut RemoteSession,
) -> Result<(), NodeError> {
    let frame = session
        .interpreter()
        .fetch(&table.name)
        .await
        .map_err(|e| NodeError::remote(owner, e))?
        .ok_or_else(|| pull_error(owner, table, table.path.source(), Fault::VariableMissing))?;
    apply_frame(owner, table, msg, &frame)?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Direction;
    use crate::memory::{Journal, MemoryInterpreter};
    use crate::path::{NamespaceBindings, PathExpr};
    use crate::tree::Scalar;
    use crate::value::ScalarKind;

    fn compile(p: &str) -> PathExpr {
        PathExpr::compile(p, &NamespaceBindings::new()).unwrap()
    }

    fn column(name: &str, kind: ScalarKind, direction: Direction, path: &str) -> ColumnBinding {
        ColumnBinding { name: name.into(), kind, direction, path: compile(path) }
    }

    fn table(columns: Vec<ColumnBinding>) -> TableBinding {
        TableBinding { name: "df".into(), path: compile("/Msg/Row"), columns }
    }

    /// `<Msg><Row><Id/><Name/></Row>...</Msg>` with the given cells.
    fn rows(cells: &[(Option<Scalar>, Option<Scalar>)]) -> (Message, Vec<NodeId>) {
        let mut msg = Message::new();
        let m = msg.tree.append_child(msg.root, "Msg");
        let rows = cells
            .iter()
            .map(|(id, name)| {
                let row = msg.tree.append_child(m, "Row");
                let i = msg.tree.append_child(row, "Id");
                msg.tree.set_value(i, id.clone());
                let n = msg.tree.append_child(row, "Name");
                msg.tree.set_value(n, name.clone());
                row
            })
            .collect();
        (msg, rows)
    }

    fn cell(msg: &Message, row: NodeId, name: &str) -> Option<Scalar> {
        let c = msg.tree.find_child(row, "", name)?;
        msg.tree.value(c).cloned()
    }

    #[test]
    fn push_builds_frame_from_in_columns() {
        let (msg, _) = rows(&[
            (Some("1".into()), Some("a".into())),
            (Some(Scalar::Int(2)), None),
        ]);
        let t = table(vec![
            column("id", ScalarKind::Integer, Direction::In, "Id"),
            column("name", ScalarKind::Character, Direction::InOut, "Name"),
            column("score", ScalarKind::Double, Direction::Out, "Score"),
        ]);
        let frame = build_frame("n", &t, &msg).unwrap();
        assert!(frame.is_data_frame());
        assert_eq!(frame.names(), [Some("id"), Some("name")]);
        assert_eq!(frame.column("id"), Some(&RValue::integer(vec![Some(1), Some(2)])));
        assert_eq!(frame.column("name"), Some(&RValue::character(vec![Some("a".into()), None])));
        assert_eq!(frame.attr("row.names"), Some(&RValue::integer(vec![None, Some(-2)])));
    }

    #[test]
    fn push_treats_missing_cell_as_null() {
        let (msg, _) = rows(&[(Some("1".into()), None)]);
        let t = table(vec![column("flag", ScalarKind::Logical, Direction::In, "Flag")]);
        let frame = build_frame("n", &t, &msg).unwrap();
        assert_eq!(frame.column("flag"), Some(&RValue::logical(vec![None])));
    }

    #[test]
    fn push_errors() {
        let (msg, _) = rows(&[]);
        let t = table(vec![column("id", ScalarKind::Integer, Direction::In, "Id")]);
        assert_eq!(build_frame("n", &t, &msg).unwrap_err().code(), 7840);

        let (msg, _) = rows(&[(Some("x".into()), None)]);
        let err = build_frame("n", &t, &msg).unwrap_err();
        assert_eq!(err.code(), 7855);
        assert_eq!(err.node.as_deref(), Some("/Root/Msg/Row/Id"));

        let t = table(vec![column("any", ScalarKind::Character, Direction::In, "*")]);
        assert_eq!(build_frame("n", &t, &msg).unwrap_err().code(), 7842);

        let mut t = table(vec![column("id", ScalarKind::Integer, Direction::In, "Id")]);
        t.path = compile("'rows'");
        assert_eq!(build_frame("n", &t, &msg).unwrap_err().code(), 7841);
    }

    #[tokio::test]
    async fn push_without_rows_assigns_nothing() {
        let (msg, _) = rows(&[]);
        let t = table(vec![column("id", ScalarKind::Integer, Direction::In, "Id")]);
        let journal = Journal::default();
        let mut session = RemoteSession::new(Box::new(MemoryInterpreter::new(0, journal.clone(), None)));
        let err = push("n", &t, &msg, &mut session).await.unwrap_err();
        assert_eq!(err.code(), 7840);
        assert_eq!(journal.assign_count(), 0);
    }

    #[test]
    fn pull_pads_rows_and_fills_positionally() {
        let mut msg = Message::new();
        let m = msg.tree.append_child(msg.root, "Msg");
        msg.tree.append_child(m, "Row");
        msg.tree.append_child(m, "Row");
        let t = table(vec![column("n", ScalarKind::Integer, Direction::Out, ".")]);
        let frame = RValue::data_frame(vec![(
            "n".into(),
            RValue::integer((1..=5).map(Some).collect()),
        )]);
        apply_frame("n", &t, &mut msg, &frame).unwrap();

        let all = msg.tree.children(m).to_vec();
        assert_eq!(all.len(), 5);
        for (i, &row) in all.iter().enumerate() {
            assert_eq!(msg.tree.name(row), "Row");
            assert_eq!(msg.tree.value(row), Some(&Scalar::Int(i as i64 + 1)));
        }
    }

    #[test]
    fn pull_repeats_last_row_over_surplus_rows() {
        let (mut msg, row_ids) = rows(&[(None, None), (None, None), (None, None)]);
        let t = table(vec![
            column("id", ScalarKind::Integer, Direction::Out, "Id"),
            column("name", ScalarKind::Character, Direction::InOut, "Name"),
        ]);
        let frame = RValue::data_frame(vec![
            ("id".into(), RValue::integer(vec![Some(7), None])),
            ("name".into(), RValue::strings(["x", "y"])),
        ]);
        apply_frame("n", &t, &mut msg, &frame).unwrap();
        assert_eq!(cell(&msg, row_ids[0], "Id"), Some(Scalar::Int(7)));
        assert_eq!(cell(&msg, row_ids[1], "Id"), None);
        assert_eq!(cell(&msg, row_ids[2], "Id"), None);
        assert_eq!(cell(&msg, row_ids[2], "Name"), Some(Scalar::from("y")));
    }

    #[test]
    fn pull_creates_cells_in_new_rows() {
        let mut msg = Message::new();
        let m = msg.tree.append_child(msg.root, "Msg");
        msg.tree.append_child(m, "Row");
        let t = table(vec![column("id", ScalarKind::Double, Direction::Out, "?Id")]);
        let frame = RValue::data_frame(vec![("id".into(), RValue::double(vec![Some(1.5), Some(2.5)]))]);
        apply_frame("n", &t, &mut msg, &frame).unwrap();
        let all = msg.tree.children(m).to_vec();
        assert_eq!(cell(&msg, all[1], "Id"), Some(Scalar::Double(2.5)));
    }

    #[test]
    fn pull_errors() {
        let (mut msg, _) = rows(&[(None, None)]);
        let t = table(vec![column("id", ScalarKind::Integer, Direction::Out, "Id")]);

        let bare = RValue::integer(vec![Some(1)]);
        assert_eq!(apply_frame("n", &t, &mut msg, &bare).unwrap_err().code(), 7835);

        let other = RValue::data_frame(vec![("x".into(), RValue::integer(vec![Some(1)]))]);
        assert_eq!(apply_frame("n", &t, &mut msg, &other).unwrap_err().code(), 7834);

        let raw = RValue::data_frame(vec![("id".into(), RValue::raw(vec![1]))]);
        assert_eq!(apply_frame("n", &t, &mut msg, &raw).unwrap_err().code(), 7849);

        let good = RValue::data_frame(vec![("id".into(), RValue::integer(vec![Some(1)]))]);
        let missing_cell = table(vec![column("id", ScalarKind::Integer, Direction::Out, "Nope")]);
        assert_eq!(apply_frame("n", &missing_cell, &mut msg, &good).unwrap_err().code(), 7847);

        let many = table(vec![column("id", ScalarKind::Integer, Direction::Out, "*")]);
        assert_eq!(apply_frame("n", &many, &mut msg, &good).unwrap_err().code(), 7846);

        let mut no_rows = table(vec![column("id", ScalarKind::Integer, Direction::Out, "Id")]);
        no_rows.path = compile("/Msg/Missing");
        assert_eq!(apply_frame("n", &no_rows, &mut msg, &good).unwrap_err().code(), 7844);
    }
}
