//! Legacy ingest path: buffered documents cognified without provenance
//!
//! Artifacts created here carry no provenance rows and are therefore
//! invisible to GC. This preserves data created before provenance existed.

use tracing::{debug, info, warn};

use super::MemoryPipeline;
use crate::error::Result;
use crate::extract::chunker::chunk_text;
use crate::ids;
use crate::storage::{graph_queries, provenance};
use crate::types::{CancelToken, CognifyOptions, CognifyResult};

/// A document buffered by `add`, waiting for cognify
#[derive(Debug, Clone)]
pub struct BufferedDoc {
    pub text: String,
    pub source: Option<String>,
}

impl MemoryPipeline {
    /// Process buffered documents into graph nodes and edges
    ///
    /// Per-document and per-chunk failures are collected into the result;
    /// the pass continues past them.
    pub fn cognify(
        &self,
        docs: &[BufferedDoc],
        options: &CognifyOptions,
        cancel: &CancelToken,
    ) -> Result<CognifyResult> {
        let mut result = CognifyResult::default();

        for doc in docs {
            cancel.check("cognify")?;

            let hash = ids::document_hash(&doc.text);
            let already_processed = self
                .storage()
                .with_connection(|conn| provenance::is_document_processed(conn, &hash))?;

            if already_processed && options.skip_processed && !options.force {
                debug!(source = ?doc.source, "document already processed, skipping");
                result.documents_skipped += 1;
                continue;
            }

            let chunks = chunk_text(&doc.text, &self.chunking);
            let mut doc_failed = false;

            for chunk in &chunks {
                cancel.check("cognify chunk")?;

                let fragment = match self.build_fragment(chunk, cancel) {
                    Ok(fragment) => fragment,
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => {
                        warn!(error = %err, "chunk extraction failed");
                        result.chunks_failed += 1;
                        result.errors.push(err.to_string());
                        doc_failed = true;
                        continue;
                    }
                };

                // No provenance links on this path; nodes and edges stay
                // legacy artifacts.
                self.storage().with_transaction(|conn| {
                    for node in &fragment.nodes {
                        graph_queries::upsert_node(conn, node)?;
                    }
                    for edge in &fragment.edges {
                        graph_queries::upsert_edge(conn, edge)?;
                    }
                    Ok(())
                })?;

                for node in &fragment.nodes {
                    if let Some(embedding) = &node.embedding {
                        self.vectors().index(&node.id, embedding);
                    }
                }

                result.chunks_processed += 1;
                result.nodes_created += fragment.nodes.len();
                result.edges_created += fragment.edges.len();
                result.edges_skipped += fragment.edges_skipped;
                result.errors.extend(fragment.warnings);
            }

            if !doc_failed {
                self.storage().with_connection(|conn| {
                    provenance::mark_document_processed(
                        conn,
                        &hash,
                        doc.source.as_deref(),
                        chunks.len() as i64,
                    )
                })?;
            }
            result.documents_processed += 1;
        }

        info!(
            documents = result.documents_processed,
            skipped = result.documents_skipped,
            nodes = result.nodes_created,
            edges = result.edges_created,
            "cognify pass complete"
        );

        Ok(result)
    }
}
