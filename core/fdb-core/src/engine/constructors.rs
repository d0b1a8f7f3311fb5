//! Fdb constructors

use super::{Archiver, EngineContext, Fdb, FdbStats, Retriever};
use crate::config::FdbConfig;
use crate::error::FdbResult;
use crate::index::KvRegistry;
use crate::schema::SchemaRegistry;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, instrument};

impl Fdb {
    /// 설정으로 FDB 핸들을 엽니다.
    ///
    /// 마스터 스키마는 프로세스 전역 스키마 캐시를 통해 읽고, KV 저장소
    /// 레지스트리는 이 핸들 전용으로 새로 만듭니다.
    ///
    /// # 인자
    ///
    /// * `config` - 루트, 스키마 경로, 엔진 및 덮어쓰기 정책
    #[instrument(skip(config))]
    pub fn new(config: FdbConfig) -> FdbResult<Self> {
        Self::with_registries(config, SchemaRegistry::global(), Arc::new(KvRegistry::new()))
    }

    /// Opens a handle sharing the given schema cache and KV store registry.
    ///
    /// Handles that share a `KvRegistry` share the open sled stores of every
    /// database they touch.
    pub fn with_registries(
        config: FdbConfig,
        schemas: Arc<SchemaRegistry>,
        kv: Arc<KvRegistry>,
    ) -> FdbResult<Self> {
        let context = Arc::new(EngineContext::new(config, schemas, kv)?);
        info!(
            roots = context.roots.roots().count(),
            engine = context.config.engine.as_str(),
            "fdb opened"
        );
        Ok(Self {
            archiver: Mutex::new(Archiver::new(context.clone())),
            retriever: Retriever::new(context.clone()),
            stats: Mutex::new(FdbStats::new()),
            context,
        })
    }

    /// Defaults overridden by `FDB_*` environment variables.
    pub fn from_env() -> FdbResult<Self> {
        Self::new(FdbConfig::from_env()?)
    }
}
