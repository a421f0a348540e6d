//! Dump Emitter
//!
//! Writes the replayable SQL script: a transactional preamble, one COPY
//! block per table in resolver order, post actions, and the closing commit.
//! Output is written to the sink as it is produced.

use crate::error::{DumpError, DumpResult, SchemaPhase};
use crate::introspection::SchemaIntrospector;
use crate::manifest::{Manifest, TableSpec};
use crate::resolver::DependencyResolver;
use crate::session::RowStreamer;
use crate::template;
use std::collections::HashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

const BEGIN_DUMP: &str = "
--
-- PostgreSQL database dump
--

BEGIN;

SET statement_timeout = 0;
SET lock_timeout = 0;
SET client_encoding = 'UTF8';
SET standard_conforming_strings = on;
SET check_function_bodies = false;
SET client_min_messages = warning;

SET search_path = public, pg_catalog;

";

const END_DUMP: &str = "
COMMIT;

--
-- PostgreSQL database dump complete
--
";

const END_TABLE_DUMP: &str = "\\.\n";

/// Totals reported once the script is complete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub tables: usize,
    pub synthesized_tables: usize,
    pub post_actions: usize,
    pub row_bytes: u64,
}

/// Quote an identifier for the COPY column list
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn table_header(table: &str, columns: &[String]) -> String {
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "\n--\n-- Data for Name: {}; Type: TABLE DATA\n--\n\nCOPY {} ({}) FROM stdin;\n",
        table,
        table,
        quoted.join(", ")
    )
}

fn post_action(sql: &str) -> String {
    format!("\n{};\n", sql)
}

/// Streams tables from one database session into a SQL script
pub struct DumpEmitter<'a, S: ?Sized> {
    session: &'a S,
}

impl<'a, S> DumpEmitter<'a, S>
where
    S: SchemaIntrospector + RowStreamer + ?Sized,
{
    pub fn new(session: &'a S) -> Self {
        Self { session }
    }

    /// Resolve `manifest` against the session and write the whole script
    pub async fn dump<W>(&self, manifest: &Manifest, sink: &mut W) -> DumpResult<DumpSummary>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut resolver = DependencyResolver::new(manifest, self.session);
        self.emit(&mut resolver, &manifest.vars, sink).await
    }

    /// Dump `manifest` into `sink` and shut the sink down on every path
    ///
    /// Output written before a failure stays in the sink. A dump error is
    /// reported ahead of a shutdown error.
    pub async fn write_script<W>(&self, manifest: &Manifest, sink: &mut W) -> DumpResult<DumpSummary>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let result = self.dump(manifest, sink).await;
        let closed = sink.shutdown().await;
        let summary = result?;
        closed?;
        Ok(summary)
    }

    /// Write the script for every table `resolver` yields
    pub async fn emit<W>(
        &self,
        resolver: &mut DependencyResolver<'_, S>,
        vars: &HashMap<String, String>,
        sink: &mut W,
    ) -> DumpResult<DumpSummary>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut summary = DumpSummary::default();

        sink.write_all(BEGIN_DUMP.as_bytes()).await?;

        while let Some(spec) = resolver.next().await? {
            summary.row_bytes += self.emit_table(&spec, vars, sink).await?;
            summary.tables += 1;
            summary.post_actions += spec.post_actions.len();
        }
        summary.synthesized_tables = resolver.synthesized();

        sink.write_all(END_DUMP.as_bytes()).await?;
        sink.flush().await?;

        info!(
            "Dump complete: {} tables ({} not in manifest), {} post actions",
            summary.tables, summary.synthesized_tables, summary.post_actions
        );
        Ok(summary)
    }

    async fn emit_table<W>(
        &self,
        spec: &TableSpec,
        vars: &HashMap<String, String>,
        sink: &mut W,
    ) -> DumpResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let columns = if spec.columns.is_empty() {
            self.session
                .columns_of(&spec.table)
                .await
                .map_err(|source| DumpError::Schema {
                    table: spec.table.clone(),
                    phase: SchemaPhase::Columns,
                    source,
                })?
        } else {
            spec.columns.clone()
        };

        // Render before writing the header so a bad template leaves no
        // partial COPY block behind
        let source = match &spec.query {
            None => spec.table.clone(),
            Some(query) => {
                let rendered = template::render(query, vars).map_err(|message| DumpError::Template {
                    table: spec.table.clone(),
                    message,
                })?;
                format!("({})", rendered)
            }
        };

        if spec.is_synthesized() {
            debug!("Dumping {} in full, it was reached through a foreign key", spec.table);
        } else {
            debug!("Dumping {} from {}", spec.table, source);
        }
        sink.write_all(table_header(&spec.table, &columns).as_bytes()).await?;

        let written = self
            .session
            .stream_out(&source, sink)
            .await
            .map_err(|source| DumpError::Stream {
                table: spec.table.clone(),
                source,
            })?;

        sink.write_all(END_TABLE_DUMP.as_bytes()).await?;

        for sql in &spec.post_actions {
            sink.write_all(post_action(sql).as_bytes()).await?;
        }

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::resolver::tests::FakeCatalog;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    /// Catalog plus canned COPY output per source expression
    struct FakeSession {
        catalog: FakeCatalog,
        rows: HashMap<String, String>,
        sources: RefCell<Vec<String>>,
        broken_columns: Option<String>,
    }

    impl FakeSession {
        fn new(catalog: FakeCatalog) -> Self {
            Self {
                catalog,
                rows: HashMap::new(),
                sources: RefCell::new(Vec::new()),
                broken_columns: None,
            }
        }

        fn rows(mut self, source: &str, data: &str) -> Self {
            self.rows.insert(source.to_string(), data.to_string());
            self
        }
    }

    #[async_trait(?Send)]
    impl SchemaIntrospector for FakeSession {
        async fn columns_of(&self, table: &str) -> Result<Vec<String>, BoxError> {
            if self.broken_columns.as_deref() == Some(table) {
                return Err("permission denied for table".into());
            }
            self.catalog.columns_of(table).await
        }

        async fn referenced_tables_of(&self, table: &str) -> Result<Vec<String>, BoxError> {
            self.catalog.referenced_tables_of(table).await
        }
    }

    #[async_trait(?Send)]
    impl RowStreamer for FakeSession {
        async fn stream_out<W>(&self, source: &str, sink: &mut W) -> Result<u64, BoxError>
        where
            W: AsyncWrite + Unpin + ?Sized,
        {
            self.sources.borrow_mut().push(source.to_string());
            let data = self
                .rows
                .get(source)
                .ok_or_else(|| format!("syntax error at or near \"{}\"", source))?;
            sink.write_all(data.as_bytes()).await?;
            Ok(data.len() as u64)
        }
    }

    async fn dump_to_string(session: &FakeSession, manifest: &Manifest) -> (String, DumpSummary) {
        let mut out: Vec<u8> = Vec::new();
        let summary = DumpEmitter::new(session).dump(manifest, &mut out).await.unwrap();
        (String::from_utf8(out).unwrap(), summary)
    }

    #[tokio::test]
    async fn test_full_script_layout() {
        let session = FakeSession::new(
            FakeCatalog::default()
                .with("users", &["id", "email"], &[])
                .with("tickets", &["id", "user_id"], &["users"]),
        )
        .rows("users", "1\ta@example.com\n2\tb@example.com\n")
        .rows("(SELECT * FROM tickets WHERE 1000 < id)", "1001\t1\n");

        let manifest = Manifest::from_yaml(
            r#"
vars:
  min_id: "1000"
tables:
  - table: tickets
    query: "SELECT * FROM tickets WHERE {{min_id}} < id"
    post_actions: ["SELECT setval('tickets_id_seq', {{min_id}})"]
  - table: users
"#,
        )
        .unwrap();

        let (script, summary) = dump_to_string(&session, &manifest).await;

        let expected = format!(
            "{}{}{}{}{}",
            BEGIN_DUMP,
            "\n--\n-- Data for Name: users; Type: TABLE DATA\n--\n\n\
             COPY users (\"id\", \"email\") FROM stdin;\n\
             1\ta@example.com\n2\tb@example.com\n\\.\n",
            "\n--\n-- Data for Name: tickets; Type: TABLE DATA\n--\n\n\
             COPY tickets (\"id\", \"user_id\") FROM stdin;\n\
             1001\t1\n\\.\n",
            "\nSELECT setval('tickets_id_seq', {{min_id}});\n",
            END_DUMP
        );
        assert_eq!(script, expected);
        assert_eq!(
            summary,
            DumpSummary {
                tables: 2,
                synthesized_tables: 0,
                post_actions: 1,
                row_bytes: 39,
            }
        );
    }

    #[tokio::test]
    async fn test_preamble_and_suffix_text() {
        let session = FakeSession::new(FakeCatalog::default());
        let (script, summary) = dump_to_string(&session, &Manifest::default()).await;

        assert!(script.starts_with("\n--\n-- PostgreSQL database dump\n--\n\nBEGIN;\n"));
        assert!(script.contains("SET search_path = public, pg_catalog;\n"));
        assert!(script.ends_with("\nCOMMIT;\n\n--\n-- PostgreSQL database dump complete\n--\n"));
        assert_eq!(summary.tables, 0);
    }

    #[tokio::test]
    async fn test_explicit_columns_skip_introspection() {
        let session = FakeSession::new(FakeCatalog::default().with("users", &["id", "email"], &[]))
            .rows("users", "");
        let manifest = Manifest {
            vars: HashMap::new(),
            tables: vec![TableSpec::new("users").with_columns(["email"])],
        };

        let (script, _) = dump_to_string(&session, &manifest).await;

        assert!(script.contains("COPY users (\"email\") FROM stdin;\n\\.\n"));
        // Only the foreign key lookup hit the catalog
        assert_eq!(*session.catalog.lookups.borrow(), vec!["users".to_string()]);
    }

    #[tokio::test]
    async fn test_synthesized_dependency_dumped_in_full() {
        let session = FakeSession::new(
            FakeCatalog::default()
                .with("orders", &["id", "customer_id"], &["customers"])
                .with("customers", &["id", "name"], &[]),
        )
        .rows("customers", "7\tAda\n")
        .rows("(SELECT * FROM orders LIMIT 5)", "1\t7\n");
        let manifest = Manifest {
            vars: HashMap::new(),
            tables: vec![TableSpec::new("orders").with_query("SELECT * FROM orders LIMIT 5")],
        };

        let (script, summary) = dump_to_string(&session, &manifest).await;

        let customers = script.find("COPY customers (\"id\", \"name\")").unwrap();
        let orders = script.find("COPY orders (\"id\", \"customer_id\")").unwrap();
        assert!(customers < orders);
        assert_eq!(
            *session.sources.borrow(),
            vec!["customers".to_string(), "(SELECT * FROM orders LIMIT 5)".to_string()]
        );
        assert_eq!(summary.synthesized_tables, 1);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("id"), "\"id\"");
        assert_eq!(quote_ident("Weird\"Name"), "\"Weird\"\"Name\"");
    }

    #[tokio::test]
    async fn test_template_error_aborts_before_header() {
        let session = FakeSession::new(FakeCatalog::default().with("users", &["id"], &[]));
        let manifest = Manifest {
            vars: HashMap::new(),
            tables: vec![TableSpec::new("users").with_query("SELECT {{id FROM users")],
        };

        let mut out: Vec<u8> = Vec::new();
        let err = DumpEmitter::new(&session).dump(&manifest, &mut out).await.unwrap_err();

        assert!(matches!(err, DumpError::Template { ref table, .. } if table == "users"));
        assert_eq!(String::from_utf8(out).unwrap(), BEGIN_DUMP);
    }

    #[tokio::test]
    async fn test_stream_error_leaves_partial_output() {
        let session = FakeSession::new(FakeCatalog::default().with("users", &["id"], &[]));
        let manifest = Manifest {
            vars: HashMap::new(),
            tables: vec![TableSpec::new("users")],
        };

        let mut out: Vec<u8> = Vec::new();
        let err = DumpEmitter::new(&session).dump(&manifest, &mut out).await.unwrap_err();

        assert!(matches!(err, DumpError::Stream { ref table, .. } if table == "users"));
        let partial = String::from_utf8(out).unwrap();
        assert!(partial.ends_with("COPY users (\"id\") FROM stdin;\n"));
        assert!(!partial.contains("COMMIT;"));
    }

    #[tokio::test]
    async fn test_unknown_table_fails_at_resolution() {
        let session = FakeSession::new(FakeCatalog::default());
        let manifest = Manifest {
            vars: HashMap::new(),
            tables: vec![TableSpec::new("ghost")],
        };
        let mut out: Vec<u8> = Vec::new();
        let err = DumpEmitter::new(&session).dump(&manifest, &mut out).await.unwrap_err();
        assert!(matches!(err, DumpError::Schema { phase: SchemaPhase::ForeignKeys, .. }));
    }

    #[tokio::test]
    async fn test_column_introspection_failure() {
        let mut session = FakeSession::new(FakeCatalog::default().with("users", &["id"], &[]));
        session.broken_columns = Some("users".to_string());
        let manifest = Manifest {
            vars: HashMap::new(),
            tables: vec![TableSpec::new("users")],
        };
        let mut out: Vec<u8> = Vec::new();
        let err = DumpEmitter::new(&session).dump(&manifest, &mut out).await.unwrap_err();

        match err {
            DumpError::Schema { table, phase, .. } => {
                assert_eq!(table, "users");
                assert_eq!(phase, SchemaPhase::Columns);
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sink_failure_surfaces_as_io_error() {
        let session = FakeSession::new(FakeCatalog::default());
        let mut sink = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
            .build();

        let err = DumpEmitter::new(&session)
            .dump(&Manifest::default(), &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::Io(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe));
    }

    #[tokio::test]
    async fn test_post_actions_keep_listed_order() {
        let session = FakeSession::new(FakeCatalog::default().with("users", &["id"], &[]))
            .rows("users", "1\n");
        let manifest = Manifest {
            vars: HashMap::new(),
            tables: vec![TableSpec::new("users").with_post_actions([
                "UPDATE users SET email = 'user' || id || '@example.com'",
                "SELECT setval('users_id_seq', 1)",
            ])],
        };

        let (script, summary) = dump_to_string(&session, &manifest).await;

        let tail = "1\n\\.\n\
                    \nUPDATE users SET email = 'user' || id || '@example.com';\n\
                    \nSELECT setval('users_id_seq', 1);\n";
        assert!(script.contains(tail), "post actions out of order:\n{}", script);
        assert_eq!(summary.post_actions, 2);
    }

    #[tokio::test]
    async fn test_failed_dump_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.sql");
        let session = FakeSession::new(
            FakeCatalog::default()
                .with("users", &["id"], &[])
                .with("tickets", &["id"], &[]),
        )
        .rows("users", "1\n2\n");
        let manifest = Manifest {
            vars: HashMap::new(),
            tables: vec![TableSpec::new("users"), TableSpec::new("tickets")],
        };

        let file = tokio::fs::File::create(&path).await.unwrap();
        let mut sink = tokio::io::BufWriter::new(file);
        let err = DumpEmitter::new(&session)
            .write_script(&manifest, &mut sink)
            .await
            .unwrap_err();
        drop(sink);

        assert!(matches!(err, DumpError::Stream { ref table, .. } if table == "tickets"));
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.starts_with(BEGIN_DUMP));
        assert!(written.contains("COPY users (\"id\") FROM stdin;\n1\n2\n\\.\n"));
        assert!(written.ends_with("COPY tickets (\"id\") FROM stdin;\n"));
    }

    #[tokio::test]
    async fn test_write_script_closes_file_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.sql");
        let session = FakeSession::new(FakeCatalog::default().with("users", &["id"], &[]))
            .rows("users", "1\n");
        let manifest = Manifest {
            vars: HashMap::new(),
            tables: vec![TableSpec::new("users")],
        };

        let file = tokio::fs::File::create(&path).await.unwrap();
        let mut sink = tokio::io::BufWriter::new(file);
        let summary = DumpEmitter::new(&session)
            .write_script(&manifest, &mut sink)
            .await
            .unwrap();
        drop(sink);

        assert_eq!(summary.tables, 1);
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(written.ends_with(END_DUMP));
    }
}
