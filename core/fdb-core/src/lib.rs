//! # FDB Core — Field Database Catalogue
//!
//! FDB는 스키마 기반 키로 필드(바이너리 레코드)를 보관하고 찾아주는 카탈로그입니다.
//! 키는 스키마 규칙에 따라 데이터베이스 / 인덱스 / 데이텀 세 단계로 나뉘며,
//! 데이터베이스마다 추가 전용(append-only) TOC 로그가 인덱스 세그먼트를 알립니다.
//!
//! ## 주요 특징
//!
//! - **Schema**: 타입이 있는 키워드와 3단계 규칙 트리, 읽기/쓰기 확장
//! - **TOC 로그**: INIT / INDEX / CLEAR / SUBTOC 레코드, 체크섬과 정렬 패딩
//! - **인덱스 백엔드**: 세그먼트 파일 또는 공유 sled 저장소 (인덱스 id 샤딩)
//! - **마스킹**: CLEAR 레코드로만 과거 데이터의 가시성을 철회
//! - **서브 로그**: 쓰기 세션마다 별도 로그, 종료 시 마스터 로그로 압축
//!
//! ## 빠른 시작
//!
//! ```rust,no_run
//! use fdb_core::{Fdb, FdbConfig, Key, Request};
//!
//! # fn main() -> fdb_core::FdbResult<()> {
//! let fdb = Fdb::new(FdbConfig::with_root("./fdb_root", "./schema"))?;
//!
//! // 아카이브 후 flush 해야 리더에 보입니다
//! let key: Key = "class=od,expver=0001,type=fc,levtype=sfc,step=0,param=t".parse()?;
//! fdb.archive(&key, b"field bytes")?;
//! fdb.flush()?;
//!
//! // 여러 값을 가진 요청으로 조회
//! let request = Request::parse("class=od,expver=0001,type=fc,levtype=sfc,step=0/6,param=t")?;
//! for field in fdb.retrieve(&request)?.fields {
//!     println!("{} -> {}", field.key, field.field.location);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## 아키텍처
//!
//! ```text
//! Key → Schema 확장 → (db key, index key, datum key)
//!     → CatalogueWriter → Index.put → flush → TOC INDEX 레코드
//!     → Store.archive → FieldLocation
//! Request → Schema 확장 → CatalogueReader → TOC 재생 → Index.get → Field
//! ```
//!
//! ## 모듈 구조
//!
//! - [`schema`] — 규칙, 술어, 키워드 타입, 스키마 캐시
//! - [`toc`] — TOC 레코드와 로그 핸들러
//! - [`index`] — 인덱스 추상화, 세그먼트/KV 백엔드
//! - [`catalogue`] — 리더, 라이터, 루트 관리, 방문자
//! - [`store`] — 필드 바이트 저장소
//! - [`engine`] — Archiver, Retriever, [`Fdb`] 파사드

pub mod catalogue;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod key;
pub mod request;
pub mod schema;
pub mod store;
pub mod sys;
pub mod toc;

// Logging utilities
pub mod logging;

// Re-export commonly used types
pub use catalogue::{Catalogue, CatalogueReader, CatalogueWriter, DbStats, ListElement};
pub use config::{EngineKind, FdbConfig, OverwritePolicy, RootConfig};
pub use engine::{Fdb, FdbStats, RetrieveResult, RetrievedField};
pub use error::{FdbError, FdbResult};
pub use index::{Field, FieldLocation};
pub use key::Key;
pub use request::Request;
pub use schema::{Schema, SchemaRegistry};
