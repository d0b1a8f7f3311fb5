//! 아카이브/조회 기본 예제
//!
//! 실행: RUST_LOG=fdb_core=debug cargo run --example archive_retrieve --features logging

use fdb_core::{Fdb, FdbConfig, Key, Request};
use std::fs;

const SCHEMA: &str = "\
expver: Expver;
step: Step;

[ class, expver
    [ type, levtype
        [ step, param ]]]
";

fn main() -> fdb_core::FdbResult<()> {
    fdb_core::logging::init();

    println!("=== FDB 아카이브/조회 예제 ===\n");

    // 1. 임시 루트와 마스터 스키마 준비
    let dir = tempfile::tempdir()?;
    let schema_path = dir.path().join("schema");
    fs::write(&schema_path, SCHEMA)?;
    let fdb = Fdb::new(FdbConfig::with_root(dir.path().join("root"), &schema_path))?;
    println!("1. 루트: {}\n", dir.path().display());

    // 2. 스텝별 필드 아카이브 후 flush
    println!("2. 아카이브...");
    for step in [0, 6, 12] {
        let key: Key = format!("class=od,expver=1,type=fc,levtype=sfc,step={step},param=t").parse()?;
        fdb.archive(&key, format!("temperature at +{step}h").as_bytes())?;
    }
    fdb.flush()?;
    println!("   ✓ 3개 필드 flush 완료\n");

    // 3. 여러 값을 가진 요청으로 조회
    println!("3. 조회...");
    let request = Request::parse("class=od,expver=0001,type=fc,levtype=sfc,step=0/12,param=t")?;
    for field in fdb.retrieve(&request)?.fields {
        let bytes = fdb.read(&field)?;
        println!("   {} = {}", field.key, String::from_utf8_lossy(&bytes));
    }
    println!();

    // 4. 목록과 축
    println!("4. 목록...");
    for element in fdb.list(&Request::new())? {
        println!("   {} @ {}", element.full_key(), element.field.location);
    }
    let steps = fdb.axis(&Request::parse("class=od")?, "step")?;
    println!("   step 축: {steps:?}\n");

    // 5. 데이터베이스 통계와 로그 덤프
    let db_key = Key::from_pairs([("class", "od"), ("expver", "0001")]);
    println!("5. 통계\n{}\n", fdb.stats(&db_key)?);
    println!("{}", fdb.dump(&db_key)?);
    println!("{}", fdb.op_stats().report("   "));

    fdb.close()?;
    Ok(())
}
