//! XML reading and writing of message bodies.
//!
//! The document element and everything below it become children of the
//! message's `Root`.  Element text is loaded as a string value; attributes
//! other than namespace declarations are ignored.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::ResolveResult;
use quick_xml::{NsReader, Writer};
use thiserror::Error;

use crate::tree::{Message, MessageTree, NodeId, Scalar};

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(#[from] quick_xml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Parse `xml` into a fresh message.
pub fn read_message(xml: &str) -> Result<Message, XmlError> {
    let mut msg = Message::new();
    let root = msg.root;
    load_into(&mut msg.tree, root, xml)?;
    Ok(msg)
}

/// Parse `xml` and append its elements under `parent`.
pub fn load_into(tree: &mut MessageTree, parent: NodeId, xml: &str) -> Result<(), XmlError> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack = vec![parent];
    loop {
        let (ns, event) = reader.read_resolved_event()?;
        let namespace = match ns {
            ResolveResult::Bound(ns) => String::from_utf8_lossy(ns.as_ref()).into_owned(),
            _ => String::new(),
        };
        match event {
            Event::Start(e) => {
                let top = *stack.last().unwrap_or(&parent);
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                stack.push(tree.append_child_ns(top, &namespace, &name));
            }
            Event::Empty(e) => {
                let top = *stack.last().unwrap_or(&parent);
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                tree.append_child_ns(top, &namespace, &name);
            }
            Event::Text(e) => {
                let text = e.unescape()?.into_owned();
                append_text(tree, *stack.last().unwrap_or(&parent), &text);
            }
            Event::CData(e) => {
                let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                append_text(tree, *stack.last().unwrap_or(&parent), &text);
            }
            Event::End(_) => {
                if stack.len() <= 1 {
                    return Err(XmlError::Malformed("unbalanced end tag".into()));
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if stack.len() != 1 {
        return Err(XmlError::Malformed("unexpected end of document".into()));
    }
    Ok(())
}

fn append_text(tree: &mut MessageTree, node: NodeId, text: &str) {
    let joined = match tree.value(node) {
        Some(Scalar::Str(prev)) => format!("{prev}{text}"),
        _ => text.to_owned(),
    };
    tree.set_value(node, Some(Scalar::Str(joined)));
}

/// Serialise the message body (the children of `Root`).
pub fn write_body(msg: &Message) -> Result<String, XmlError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    for &child in msg.tree.children(msg.root) {
        write_element(&mut writer, &msg.tree, child, "")?;
    }
    String::from_utf8(writer.into_inner()).map_err(|e| XmlError::Malformed(e.to_string()))
}

fn write_element(
    writer: &mut Writer<Vec<u8>>,
    tree: &MessageTree,
    node: NodeId,
    parent_ns: &str,
) -> Result<(), XmlError> {
    let name = tree.name(node);
    let ns = tree.namespace(node);
    let mut start = BytesStart::new(name);
    if ns != parent_ns {
        start.push_attribute(("xmlns", ns));
    }

    let children = tree.children(node);
    let text = tree.value(node).map(Scalar::to_string);
    if children.is_empty() && text.is_none() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }
    writer.write_event(Event::Start(start))?;
    if let Some(text) = &text {
        writer.write_event(Event::Text(BytesText::new(text)))?;
    }
    for &child in children {
        write_element(writer, tree, child, ns)?;
    }
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
