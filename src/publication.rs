//! 복제 publication 정렬
//!
//! 스트리밍 시작 전에 publication 멤버십을 "구독 리스너가 있는 테이블" 집합과 일치시킵니다.
//! 모든 문장은 하나의 DB 트랜잭션 안에서 실행되고 명시적으로 commit 됩니다.
//!
//! wal2json peek은 publication을 읽지 않으므로, 정렬된 테이블 집합을 스트림 필터로 돌려줍니다.
//! 소스에 없는 구독 테이블은 필터에서 빠집니다.

use crate::connection::{connect_postgres, PgConnectionConfig};
use crate::error::{CdcError, Result};
use crate::replication::TableFilter;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio_postgres::Transaction;
use tracing::{debug, info};

/// 스트리밍 시작 전 정렬 단계
#[async_trait]
pub trait Aligner: Send + Sync {
    /// publication을 맞추고 실제로 스트리밍할 테이블 필터를 돌려줌
    async fn align(&self, filter: &TableFilter) -> Result<TableFilter>;
}

/// publication 조회/변경 세션 (하나의 DB 트랜잭션)
#[async_trait]
pub trait PublicationSession: Send {
    /// 현재 멤버 테이블 (`None`이면 publication 없음)
    async fn publication_tables(&mut self, publication: &str) -> Result<Option<BTreeSet<String>>>;

    /// publication에 넣을 수 있는 전체 테이블
    async fn candidate_tables(&mut self) -> Result<BTreeSet<String>>;

    async fn execute(&mut self, statement: &str) -> Result<()>;
}

/// 정렬 계획
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlignmentPlan {
    /// publication 신규 생성 (desired 전체로)
    pub create: bool,
    pub desired: BTreeSet<String>,
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl AlignmentPlan {
    pub fn compute(
        existing: Option<&BTreeSet<String>>,
        candidates: &BTreeSet<String>,
        filter: &TableFilter,
    ) -> Self {
        let desired: BTreeSet<String> = candidates
            .iter()
            .filter(|table| filter.matches(table))
            .cloned()
            .collect();

        match existing {
            None => AlignmentPlan {
                create: true,
                to_add: desired.clone(),
                desired,
                to_remove: BTreeSet::new(),
            },
            Some(existing) => AlignmentPlan {
                create: false,
                to_add: desired.difference(existing).cloned().collect(),
                to_remove: existing.difference(&desired).cloned().collect(),
                desired,
            },
        }
    }

    /// 정렬 후 publication 멤버십과 같은 스트림 필터
    pub fn filter(&self) -> TableFilter {
        TableFilter::from_tables(self.desired.iter().cloned())
    }

    pub fn is_noop(&self) -> bool {
        !self.create && self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// 실행할 DDL 문장들 (빈 집합의 문장은 생략)
    pub fn statements(&self, publication: &str) -> Vec<String> {
        let publication = quote_ident(publication);

        if self.create {
            return if self.desired.is_empty() {
                vec![format!("CREATE PUBLICATION {}", publication)]
            } else {
                vec![format!(
                    "CREATE PUBLICATION {} FOR TABLE {}",
                    publication,
                    table_list(&self.desired)
                )]
            };
        }

        let mut statements = Vec::new();
        if !self.to_add.is_empty() {
            statements.push(format!(
                "ALTER PUBLICATION {} ADD TABLE {}",
                publication,
                table_list(&self.to_add)
            ));
        }
        if !self.to_remove.is_empty() {
            statements.push(format!(
                "ALTER PUBLICATION {} DROP TABLE {}",
                publication,
                table_list(&self.to_remove)
            ));
        }
        statements
    }
}

/// 세션 안에서 정렬 수행 (commit은 호출자 몫)
pub async fn align_in(
    session: &mut dyn PublicationSession,
    publication: &str,
    filter: &TableFilter,
) -> Result<AlignmentPlan> {
    let existing = session.publication_tables(publication).await?;
    let candidates = session.candidate_tables().await?;
    let plan = AlignmentPlan::compute(existing.as_ref(), &candidates, filter);

    for statement in plan.statements(publication) {
        debug!("Publication alignment: {}", statement);
        session.execute(&statement).await?;
    }
    Ok(plan)
}

/// `schema.table` → `"schema"."table"`
fn quote_table(table_id: &str) -> String {
    match table_id.split_once('.') {
        Some((schema, table)) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
        None => quote_ident(table_id),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn table_list(tables: &BTreeSet<String>) -> String {
    tables
        .iter()
        .map(|t| quote_table(t))
        .collect::<Vec<_>>()
        .join(", ")
}

/// tokio-postgres 트랜잭션 위의 세션
pub struct PgPublicationSession<'a> {
    tx: Transaction<'a>,
}

impl<'a> PgPublicationSession<'a> {
    pub fn new(tx: Transaction<'a>) -> Self {
        PgPublicationSession { tx }
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl<'a> PublicationSession for PgPublicationSession<'a> {
    async fn publication_tables(&mut self, publication: &str) -> Result<Option<BTreeSet<String>>> {
        let exists = self
            .tx
            .query_opt("SELECT 1 FROM pg_publication WHERE pubname = $1", &[&publication])
            .await?;
        if exists.is_none() {
            return Ok(None);
        }

        let rows = self
            .tx
            .query(
                "SELECT schemaname::text, tablename::text FROM pg_publication_tables \
                 WHERE pubname = $1",
                &[&publication],
            )
            .await?;
        Ok(Some(
            rows.iter()
                .map(|row| format!("{}.{}", row.get::<_, String>(0), row.get::<_, String>(1)))
                .collect(),
        ))
    }

    async fn candidate_tables(&mut self) -> Result<BTreeSet<String>> {
        let rows = self
            .tx
            .query(
                "SELECT schemaname::text, tablename::text FROM pg_tables \
                 WHERE schemaname NOT IN ('pg_catalog', 'information_schema')",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| format!("{}.{}", row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    async fn execute(&mut self, statement: &str) -> Result<()> {
        self.tx
            .batch_execute(statement)
            .await
            .map_err(|e| CdcError::PublicationError(format!("{}: {}", statement, e)))
    }
}

/// PostgreSQL publication 정렬기
pub struct PublicationAligner {
    connection: PgConnectionConfig,
    publication: String,
}

impl PublicationAligner {
    pub fn new(connection: PgConnectionConfig, publication: impl Into<String>) -> Self {
        PublicationAligner {
            connection,
            publication: publication.into(),
        }
    }
}

#[async_trait]
impl Aligner for PublicationAligner {
    async fn align(&self, filter: &TableFilter) -> Result<TableFilter> {
        info!("Aligning publication '{}'", self.publication);

        let mut client = connect_postgres(&self.connection).await?;
        let tx = client.transaction().await?;
        let mut session = PgPublicationSession::new(tx);

        // 실패 시 session(트랜잭션)이 drop되며 롤백됨
        let plan = align_in(&mut session, &self.publication, filter)
            .await
            .map_err(|e| CdcError::PublicationError(e.to_string()))?;
        session.commit().await?;

        if plan.is_noop() {
            info!("Publication '{}' already aligned", self.publication);
        } else {
            info!(
                "Publication '{}' aligned: created={}, added={:?}, removed={:?}",
                self.publication, plan.create, plan.to_add, plan.to_remove
            );
        }
        Ok(plan.filter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// pg 카탈로그를 흉내 내는 세션
    struct FakeSession {
        publication: Option<BTreeSet<String>>,
        candidates: BTreeSet<String>,
        executed: Vec<String>,
    }

    impl FakeSession {
        fn new(publication: Option<&[&str]>, candidates: &[&str]) -> Self {
            FakeSession {
                publication: publication.map(set),
                candidates: set(candidates),
                executed: Vec::new(),
            }
        }
    }

    fn set(tables: &[&str]) -> BTreeSet<String> {
        tables.iter().map(|t| t.to_string()).collect()
    }

    #[async_trait]
    impl PublicationSession for FakeSession {
        async fn publication_tables(
            &mut self,
            _publication: &str,
        ) -> Result<Option<BTreeSet<String>>> {
            Ok(self.publication.clone())
        }

        async fn candidate_tables(&mut self) -> Result<BTreeSet<String>> {
            Ok(self.candidates.clone())
        }

        async fn execute(&mut self, statement: &str) -> Result<()> {
            self.executed.push(statement.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_alignment_converges() {
        let mut session = FakeSession::new(
            Some(&["public.a", "public.b"][..]),
            &["public.a", "public.b", "public.c", "public.d"],
        );
        let filter = TableFilter::from_tables(["public.b", "public.c"]);

        let plan = align_in(&mut session, "edge_pub", &filter).await.unwrap();

        assert_eq!(plan.to_add, set(&["public.c"]));
        assert_eq!(plan.to_remove, set(&["public.a"]));
        assert_eq!(
            session.executed,
            vec![
                r#"ALTER PUBLICATION "edge_pub" ADD TABLE "public"."c""#.to_string(),
                r#"ALTER PUBLICATION "edge_pub" DROP TABLE "public"."a""#.to_string(),
            ]
        );

        let existing = session.publication.as_ref().unwrap();
        let converged: BTreeSet<String> = existing
            .union(&plan.to_add)
            .filter(|t| !plan.to_remove.contains(*t))
            .cloned()
            .collect();
        assert_eq!(converged, plan.desired);
    }

    #[tokio::test]
    async fn test_missing_publication_is_created_in_one_statement() {
        let mut session = FakeSession::new(None, &["public.a", "public.b"]);
        let filter = TableFilter::from_tables(["public.a", "public.b", "public.gone"]);

        let plan = align_in(&mut session, "edge_pub", &filter).await.unwrap();

        assert!(plan.create);
        assert_eq!(plan.desired, set(&["public.a", "public.b"]));
        assert_eq!(
            session.executed,
            vec![
                r#"CREATE PUBLICATION "edge_pub" FOR TABLE "public"."a", "public"."b""#.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_filter_is_the_aligned_set() {
        let mut session = FakeSession::new(Some(&["public.a"][..]), &["public.a", "public.b"]);
        let filter = TableFilter::from_tables(["public.b", "public.gone"]);

        let plan = align_in(&mut session, "edge_pub", &filter).await.unwrap();

        assert_eq!(plan.filter(), TableFilter::from_tables(["public.b"]));
        assert!(plan.filter().matches("public.b"));
        assert!(!plan.filter().matches("public.gone"));
        assert!(!plan.filter().matches("public.a"));

        let mut empty = FakeSession::new(None, &["public.a"]);
        let plan = align_in(&mut empty, "edge_pub", &TableFilter::from_tables(["public.gone"]))
            .await
            .unwrap();
        assert_eq!(plan.filter(), TableFilter::NoListeners);
    }

    #[tokio::test]
    async fn test_aligned_publication_issues_nothing() {
        let mut session = FakeSession::new(Some(&["public.a"][..]), &["public.a"]);
        let plan = align_in(&mut session, "edge_pub", &TableFilter::from_tables(["public.a"]))
            .await
            .unwrap();
        assert!(plan.is_noop());
        assert!(session.executed.is_empty());
    }

    #[tokio::test]
    async fn test_no_listeners_empties_publication() {
        let mut session = FakeSession::new(Some(&["public.a"][..]), &["public.a"]);
        let plan = align_in(&mut session, "edge_pub", &TableFilter::NoListeners)
            .await
            .unwrap();
        assert_eq!(plan.to_remove, set(&["public.a"]));
        assert_eq!(session.executed.len(), 1);

        let mut fresh = FakeSession::new(None, &["public.a"]);
        align_in(&mut fresh, "edge_pub", &TableFilter::NoListeners)
            .await
            .unwrap();
        assert_eq!(fresh.executed, vec![r#"CREATE PUBLICATION "edge_pub""#.to_string()]);
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_table("public.odd\"name"), r#""public"."odd""name""#);
    }

    #[tokio::test]
    #[ignore] // 실제 PostgreSQL 연결 필요
    async fn test_align_against_postgres() {
        let aligner = PublicationAligner::new(PgConnectionConfig::default(), "edge_sync_test_pub");
        let filter = aligner
            .align(&TableFilter::from_tables(["public.edge_sync_test"]))
            .await
            .unwrap();
        assert!(filter.tables().len() <= 1);
    }
}
