//! Scalar bindings: one typed vector per binding.
//!
//! Pushing collects the value of every element the path selects (or the
//! single value of a scalar expression) into a vector.  Pulling spreads a
//! vector over the selected elements, adding siblings when the vector is
//! longer and repeating its last element when it is shorter.

use tracing::trace;

use crate::binding::ScalarBinding;
use crate::coerce::{scalar_at, VectorBuilder};
use crate::error::{code, kind_index, BindingError, Fault, NodeError, Site};
use crate::path::PathValue;
use crate::session::RemoteSession;
use crate::tree::Message;
use crate::value::RValue;

// ── Push ──────────────────────────────────────────────────────────────────────

/// Build the vector a binding sends to the interpreter.
pub fn build_vector(
    owner: &str,
    binding: &ScalarBinding,
    msg: &Message,
) -> Result<RValue, BindingError> {
    let fail = |fault| BindingError::new(Site::VariablePush, owner, &binding.name, binding.path.source(), fault);

    let result = binding.path.evaluate(msg, None).map_err(|e| fail(Fault::Path(e)))?;
    match result {
        PathValue::Nodes(nodes) => {
            if nodes.is_empty() {
                return Err(fail(Fault::EmptyNodeset));
            }
            let mut builder = VectorBuilder::new(binding.kind, nodes.len());
            for &node in &nodes {
                builder.push(msg.tree.value(node)).map_err(|e| {
                    fail(Fault::Convert { kind: e.kind, value: e.value, from_element: true })
                        .at(msg.tree.display_path(node))
                })?;
            }
            Ok(builder.finish())
        }
        PathValue::Scalar(value) => {
            let mut builder = VectorBuilder::new(binding.kind, 1);
            builder.push(Some(&value)).map_err(|e| {
                fail(Fault::Convert { kind: e.kind, value: e.value, from_element: false })
            })?;
            Ok(builder.finish())
        }
    }
}

/// Evaluate the binding against `msg` and assign the vector in the session.
pub async fn push(
    owner: &str,
    binding: &ScalarBinding,
    msg: &Message,
    session: &mut RemoteSession,
) -> Result<(), NodeError> {
    let value = build_vector(owner, binding, msg)?;
    trace!(
        code = code::VARIABLE_ASSIGN[kind_index(binding.kind)],
        node = owner,
        variable = %binding.name,
        length = value.len(),
        "assigning variable"
    );
    session
        .interpreter()
        .assign(&binding.name, &value)
        .await
        .map_err(|e| NodeError::remote(owner, e))
}

// ── Pull ──────────────────────────────────────────────────────────────────────

/// Write `value` into the elements the binding selects in `msg`.
pub fn apply_vector(
    owner: &str,
    binding: &ScalarBinding,
    msg: &mut Message,
    value: &RValue,
) -> Result<(), BindingError> {
    let fail = |fault| BindingError::new(Site::VariablePull, owner, &binding.name, binding.path.source(), fault);

    let mut nodes = match binding.path.evaluate_mut(msg, None).map_err(|e| fail(Fault::Path(e)))? {
        PathValue::Nodes(nodes) => nodes,
        PathValue::Scalar(_) => return Err(fail(Fault::NotNodeset)),
    };
    if nodes.is_empty() {
        return Err(fail(Fault::EmptyNodeset));
    }
    let Some(kind) = value.kind() else {
        return Err(fail(Fault::UnsupportedType { found: value.type_name(), column: None }));
    };

    let len = value.len();
    while nodes.len() < len {
        let last = nodes[nodes.len() - 1];
        let created = msg
            .tree
            .create_sibling_after(last)
            .map_err(|e| fail(Fault::Tree(e.to_string())))?;
        trace!(code = code::NEW_ELEMENT, node = owner, element = %msg.tree.display_path(created), "created element");
        nodes.push(created);
    }

    for (i, &node) in nodes.iter().enumerate() {
        // Surplus elements repeat the last value; an empty vector nulls them all.
        let element = len.checked_sub(1).and_then(|last| scalar_at(value, i.min(last)));
        trace!(
            code = code::VARIABLE_FETCH[kind_index(kind)],
            node = owner,
            variable = %binding.name,
            element = %msg.tree.display_path(node),
            value = ?element,
            "assigning element"
        );
        msg.tree.set_value(node, element);
    }
    Ok(())
}

/// Fetch the binding's variable from the session and write it into `msg`.
pub async fn pull(
    owner: &str,
    binding: &ScalarBinding,
    msg: &mut Message,
    session: &mut RemoteSession,
) -> Result<(), NodeError> {
    let value = session
        .interpreter()
        .fetch(&binding.name)
        .await
        .map_err(|e| NodeError::remote(owner, e))?
        .ok_or_else(|| {
            BindingError::new(
                Site::VariablePull,
                owner,
                &binding.name,
                binding.path.source(),
                Fault::VariableMissing,
            )
        })?;
    apply_vector(owner, binding, msg, &value)?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
