//! Formatos de intercambio de filas: json, yamr (texto y lenval), dsv,
//! schemaful_dsv y yamred_dsv. YSON lo resuelve un colaborador externo.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TmError};

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Format {
    Json,
    Yson,
    Yamr {
        #[serde(default)]
        has_subkey: bool,
        #[serde(default)]
        lenval: bool,
    },
    Dsv,
    SchemafulDsv {
        columns: Vec<String>,
    },
    YamredDsv {
        key_column_names: Vec<String>,
        #[serde(default)]
        subkey_column_names: Vec<String>,
        #[serde(default)]
        has_subkey: bool,
    },
}

impl Format {
    pub fn yamr() -> Self {
        Format::Yamr {
            has_subkey: true,
            lenval: false,
        }
    }

    pub fn yamr_lenval() -> Self {
        Format::Yamr {
            has_subkey: true,
            lenval: true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Yson => "yson",
            Format::Yamr { .. } => "yamr",
            Format::Dsv => "dsv",
            Format::SchemafulDsv { .. } => "schemaful_dsv",
            Format::YamredDsv { .. } => "yamred_dsv",
        }
    }

    pub fn encode_rows(&self, rows: &[Row]) -> Result<Bytes> {
        let mut out = BytesMut::new();
        for row in rows {
            self.encode_row(row, &mut out)?;
        }
        Ok(out.freeze())
    }

    pub fn decode_rows(&self, data: &[u8]) -> Result<Vec<Row>> {
        match self {
            Format::Json => lines(data)
                .map(|line| -> Result<Row> {
                    let v: Value = serde_json::from_slice(line)?;
                    match v {
                        Value::Object(obj) => Ok(obj),
                        other => Err(TmError::format(format!(
                            "json row must be a map, got {other}"
                        ))),
                    }
                })
                .collect(),
            Format::Yson => Err(yson_unsupported()),
            Format::Yamr {
                has_subkey,
                lenval: true,
            } => decode_lenval(data, *has_subkey),
            Format::Yamr {
                has_subkey,
                lenval: false,
            } => lines(data)
                .map(|line| decode_yamr_line(line, *has_subkey))
                .collect(),
            Format::Dsv => lines(data).map(decode_dsv_line).collect(),
            Format::SchemafulDsv { columns } => records(data)
                .filter(|line| columns.len() == 1 || !line.is_empty())
                .map(|line| -> Result<Row> {
                    let text = utf8(line)?;
                    let fields: Vec<&str> = text.split('\t').collect();
                    if fields.len() != columns.len() {
                        return Err(TmError::format(format!(
                            "schemaful_dsv row has {} fields, expected {}",
                            fields.len(),
                            columns.len()
                        )));
                    }
                    Ok(columns
                        .iter()
                        .zip(fields)
                        .map(|(c, f)| (c.clone(), Value::String(unescape(f))))
                        .collect())
                })
                .collect(),
            Format::YamredDsv {
                key_column_names,
                subkey_column_names,
                has_subkey,
            } => lines(data)
                .map(|line| -> Result<Row> {
                    let yamr = decode_yamr_line(line, *has_subkey)?;
                    let mut row = Row::new();
                    split_key_columns(&yamr, "key", key_column_names, &mut row)?;
                    if *has_subkey {
                        split_key_columns(&yamr, "subkey", subkey_column_names, &mut row)?;
                    }
                    let value = yamr.get("value").and_then(Value::as_str).unwrap_or("");
                    if !value.is_empty() {
                        row.extend(decode_dsv_line(value.as_bytes())?);
                    }
                    Ok(row)
                })
                .collect(),
        }
    }

    fn encode_row(&self, row: &Row, out: &mut BytesMut) -> Result<()> {
        match self {
            Format::Json => {
                out.put_slice(&serde_json::to_vec(row)?);
                out.put_u8(b'\n');
            }
            Format::Yson => return Err(yson_unsupported()),
            Format::Yamr { has_subkey, lenval } => {
                let key = field_text(row, "key")?;
                let value = field_text(row, "value")?;
                let subkey = if *has_subkey {
                    Some(row.get("subkey").map(render).unwrap_or_default())
                } else {
                    None
                };
                if *lenval {
                    put_lenval(out, &key);
                    if let Some(subkey) = &subkey {
                        put_lenval(out, subkey);
                    }
                    put_lenval(out, &value);
                } else {
                    check_yamr_text("key", &key, true)?;
                    if let Some(subkey) = &subkey {
                        check_yamr_text("subkey", subkey, true)?;
                    }
                    check_yamr_text("value", &value, false)?;
                    out.put_slice(key.as_bytes());
                    out.put_u8(b'\t');
                    if let Some(subkey) = &subkey {
                        out.put_slice(subkey.as_bytes());
                        out.put_u8(b'\t');
                    }
                    out.put_slice(value.as_bytes());
                    out.put_u8(b'\n');
                }
            }
            Format::Dsv => {
                out.put_slice(encode_dsv(row.iter()).as_bytes());
                out.put_u8(b'\n');
            }
            Format::SchemafulDsv { columns } => {
                let mut fields = Vec::with_capacity(columns.len());
                for column in columns {
                    let value = row.get(column).ok_or_else(|| {
                        TmError::format(format!("column {column:?} is missing in row"))
                    })?;
                    fields.push(escape(&render(value), false));
                }
                out.put_slice(fields.join("\t").as_bytes());
                out.put_u8(b'\n');
            }
            Format::YamredDsv {
                key_column_names,
                subkey_column_names,
                has_subkey,
            } => {
                let key = join_key_columns(row, key_column_names)?;
                let mut yamr = Row::new();
                yamr.insert("key".into(), Value::String(key));
                if *has_subkey {
                    let subkey = join_key_columns(row, subkey_column_names)?;
                    yamr.insert("subkey".into(), Value::String(subkey));
                }
                let rest = row.iter().filter(|(k, _)| {
                    !key_column_names.contains(k) && !subkey_column_names.contains(k)
                });
                yamr.insert("value".into(), Value::String(encode_dsv(rest)));
                Format::Yamr {
                    has_subkey: *has_subkey,
                    lenval: false,
                }
                .encode_row(&yamr, out)?;
            }
        }
        Ok(())
    }
}

fn yson_unsupported() -> TmError {
    TmError::format("yson format is handled by an external codec")
}

fn lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|b| *b == b'\n').filter(|l| !l.is_empty())
}

/// Registros terminados en `\n`. A diferencia de `lines`, conserva los
/// registros vacíos; solo descarta el trozo tras el último separador.
fn records(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let empty = data.is_empty();
    let data = data.strip_suffix(b"\n").unwrap_or(data);
    data.split(|b| *b == b'\n').filter(move |_| !empty)
}

/// En yamr de texto el tabulador separa campos y el salto de línea separa
/// registros; key y subkey no admiten ninguno, value no admite saltos.
fn check_yamr_text(name: &str, field: &str, is_key: bool) -> Result<()> {
    if field.contains('\n') || (is_key && field.contains('\t')) {
        return Err(TmError::format(format!(
            "yamr {name} {field:?} contains a separator; use lenval"
        )));
    }
    Ok(())
}

fn utf8(data: &[u8]) -> Result<&str> {
    std::str::from_utf8(data).map_err(|e| TmError::format(format!("invalid utf-8: {e}")))
}

/// Texto plano de un valor: los strings sin comillas, el resto como JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn field_text(row: &Row, name: &str) -> Result<String> {
    row.get(name)
        .map(render)
        .ok_or_else(|| TmError::format(format!("yamr row has no {name:?} field")))
}

fn put_lenval(out: &mut BytesMut, field: &str) {
    out.put_u32_le(field.len() as u32);
    out.put_slice(field.as_bytes());
}

fn decode_lenval(mut data: &[u8], has_subkey: bool) -> Result<Vec<Row>> {
    let names: &[&str] = if has_subkey {
        &["key", "subkey", "value"]
    } else {
        &["key", "value"]
    };
    let mut rows = Vec::new();
    while !data.is_empty() {
        let mut row = Row::new();
        for name in names {
            if data.len() < 4 {
                return Err(TmError::format("truncated lenval length"));
            }
            let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            data = &data[4..];
            if data.len() < len {
                return Err(TmError::format("truncated lenval field"));
            }
            let field = utf8(&data[..len])?;
            row.insert((*name).to_string(), Value::String(field.to_string()));
            data = &data[len..];
        }
        rows.push(row);
    }
    Ok(rows)
}

fn decode_yamr_line(line: &[u8], has_subkey: bool) -> Result<Row> {
    let text = utf8(line)?;
    let parts = if has_subkey { 3 } else { 2 };
    let fields: Vec<&str> = text.splitn(parts, '\t').collect();
    if fields.len() != parts {
        return Err(TmError::format(format!("malformed yamr line: {text:?}")));
    }
    let mut row = Row::new();
    row.insert("key".into(), Value::String(fields[0].to_string()));
    if has_subkey {
        row.insert("subkey".into(), Value::String(fields[1].to_string()));
    }
    row.insert(
        "value".into(),
        Value::String(fields[parts - 1].to_string()),
    );
    Ok(row)
}

fn escape(s: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\0' => out.push_str("\\0"),
            '=' if is_key => out.push_str("\\="),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn encode_dsv<'a>(fields: impl Iterator<Item = (&'a String, &'a Value)>) -> String {
    fields
        .map(|(k, v)| format!("{}={}", escape(k, true), escape(&render(v), false)))
        .collect::<Vec<_>>()
        .join("\t")
}

fn decode_dsv_line(line: &[u8]) -> Result<Row> {
    let text = utf8(line)?;
    let mut row = Row::new();
    for field in text.split('\t').filter(|f| !f.is_empty()) {
        // el primer '=' sin escapar separa clave y valor
        let mut split_at = None;
        let mut escaped = false;
        for (i, c) in field.char_indices() {
            match c {
                '\\' if !escaped => escaped = true,
                '=' if !escaped => {
                    split_at = Some(i);
                    break;
                }
                _ => escaped = false,
            }
        }
        let i = split_at
            .ok_or_else(|| TmError::format(format!("dsv field without '=': {field:?}")))?;
        row.insert(
            unescape(&field[..i]),
            Value::String(unescape(&field[i + 1..])),
        );
    }
    Ok(row)
}

fn join_key_columns(row: &Row, columns: &[String]) -> Result<String> {
    let mut parts = Vec::with_capacity(columns.len());
    for column in columns {
        let value = row
            .get(column)
            .ok_or_else(|| TmError::format(format!("key column {column:?} is missing")))?;
        parts.push(render(value));
    }
    Ok(parts.join(" "))
}

fn split_key_columns(yamr: &Row, field: &str, columns: &[String], row: &mut Row) -> Result<()> {
    let text = yamr.get(field).and_then(Value::as_str).unwrap_or("");
    let parts: Vec<&str> = if columns.is_empty() {
        Vec::new()
    } else {
        text.splitn(columns.len(), ' ').collect()
    };
    if parts.len() != columns.len() {
        return Err(TmError::format(format!(
            "yamred_dsv {field} {text:?} does not match columns {columns:?}"
        )));
    }
    for (c, p) in columns.iter().zip(parts) {
        row.insert(c.clone(), Value::String(p.to_string()));
    }
    Ok(())
}
