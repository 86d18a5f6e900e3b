//! Common test utilities shared across integration tests.
//!
//! Builds the warehouse refresh pipeline from `pipelines/sparkify_etl.yaml`
//! together with an in-memory warehouse whose transforms mimic the load
//! SQL, and an in-memory bucket holding a handful of events and songs.

#![allow(dead_code)]

use serde_json::{Value, json};
use stagehand::warehouse::{Row, TableView, WarehouseError};
use stagehand::{
    Credentials, Executor, Graph, InMemoryStorageReader, InMemoryWarehouse, PipelineBuilder,
    RunConfig, StaticCredentials, TaskParams, WarehousePool, WarehouseRunner,
};
use std::path::PathBuf;
use std::sync::Arc;

pub const BUCKET: &str = "udacity-dend";

pub const TABLES: [&str; 7] = [
    "staging_events",
    "staging_songs",
    "songplays",
    "users",
    "songs",
    "artists",
    "time",
];

/// Four log events: three plays by two users and one page view.
pub const EVENTS: [&str; 4] = [
    r#"{"artist":"Des'ree","auth":"Logged In","firstName":"Kaylee","gender":"F","itemInSession":1,"lastName":"Summers","length":246.30812,"level":"free","location":"Phoenix-Mesa-Scottsdale, AZ","method":"PUT","page":"NextSong","registration":1540344794796.0,"sessionId":139,"song":"You Gotta Be","status":200,"ts":1541106106796,"userAgent":"Mozilla/5.0","userId":"8"}"#,
    r#"{"artist":null,"auth":"Logged In","firstName":"Kaylee","gender":"F","itemInSession":2,"lastName":"Summers","length":null,"level":"free","location":"Phoenix-Mesa-Scottsdale, AZ","method":"GET","page":"Upgrade","registration":1540344794796.0,"sessionId":139,"song":null,"status":200,"ts":1541106132796,"userAgent":"Mozilla/5.0","userId":"8"}"#,
    r#"{"artist":"Mr Oizo","auth":"Logged In","firstName":"Kaylee","gender":"F","itemInSession":3,"lastName":"Summers","length":144.03873,"level":"free","location":"Phoenix-Mesa-Scottsdale, AZ","method":"PUT","page":"NextSong","registration":1540344794796.0,"sessionId":139,"song":"Flat 55","status":200,"ts":1541106352796,"userAgent":"Mozilla/5.0","userId":"8"}"#,
    r#"{"artist":"Des'ree","auth":"Logged In","firstName":"Lily","gender":"F","itemInSession":0,"lastName":"Koch","length":246.30812,"level":"paid","location":"Chicago-Naperville-Elgin, IL-IN-WI","method":"PUT","page":"NextSong","registration":1541048010796.0,"sessionId":172,"song":"You Gotta Be","status":200,"ts":1541106496796,"userAgent":"Mozilla/5.0","userId":"15"}"#,
];

/// Two songs, one object each.
pub const SONGS: [(&str, &str); 2] = [
    (
        "song_data/A/A/A/TRAAAAK128F9318786.json",
        r#"{"num_songs":1,"artist_id":"ARJNIUY12298900C91","artist_latitude":null,"artist_location":"","artist_longitude":null,"artist_name":"Des'ree","song_id":"SOBONKR12A58A7A7E0","title":"You Gotta Be","duration":246.30812,"year":1994}"#,
    ),
    (
        "song_data/A/B/C/TRABCAJ12903CDFCC2.json",
        r#"{"num_songs":1,"artist_id":"ARH4Z031187B9A71F2","artist_latitude":40.73197,"artist_location":"Paris","artist_longitude":-74.17418,"artist_name":"Mr Oizo","song_id":"SOZCTXZ12AB0182364","title":"Flat 55","duration":144.03873,"year":2005}"#,
    ),
];

pub fn pipeline_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("pipelines/sparkify_etl.yaml")
}

/// The refresh pipeline with everything it runs against.
pub struct Sparkify {
    pub graph: Arc<Graph>,
    pub config: RunConfig,
    pub warehouse: Arc<InMemoryWarehouse>,
    pub storage: Arc<InMemoryStorageReader>,
}

impl Sparkify {
    pub fn new() -> Self {
        let pipeline = PipelineBuilder::load(pipeline_path()).unwrap();
        let graph = Arc::new(pipeline.graph);
        let warehouse = Arc::new(warehouse_for(&graph));

        let mut storage = InMemoryStorageReader::new().with_object(
            BUCKET,
            "log_data/2018/11/2018-11-01-events.json",
            EVENTS,
        );
        for (key, line) in SONGS {
            storage = storage.with_object(BUCKET, key, [line]);
        }

        Self {
            graph,
            config: pipeline.run_config,
            warehouse,
            storage: Arc::new(storage),
        }
    }

    /// An executor running the real task behaviors against the in-memory
    /// collaborators.
    pub fn executor(&self) -> Executor {
        let pool = WarehousePool::new(self.warehouse.clone(), 4);
        let credentials = StaticCredentials::new().with(
            "aws_credentials",
            Credentials::new("AKIAEXAMPLE", "wJalrXUtnFEMI/K7MDENG"),
        );
        let runner = WarehouseRunner::new(&self.config, pool, self.storage.clone())
            .with_credentials(Arc::new(credentials));
        Executor::new(self.config.clone(), Arc::new(runner))
    }

    /// The load SQL of the task writing `target`.
    pub fn load_sql(&self, target: &str) -> String {
        self.graph
            .tasks()
            .find_map(|task| match &task.params {
                TaskParams::LoadFact(p) if p.target == target => Some(p.sql.clone()),
                TaskParams::LoadDimension(p) if p.target == target => Some(p.sql.clone()),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no load task writes {target}"))
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.warehouse.row_count(table).unwrap()
    }
}

type TransformFn = fn(&TableView<'_>) -> Result<Vec<Row>, WarehouseError>;

/// A warehouse with every relation created and every load transform
/// registered under the pipeline's SQL.
pub fn warehouse_for(graph: &Graph) -> InMemoryWarehouse {
    let warehouse = TABLES
        .iter()
        .fold(InMemoryWarehouse::new(), |w, table| w.with_table(*table));

    for task in graph.tasks() {
        let (sql, target) = match &task.params {
            TaskParams::LoadFact(p) => (&p.sql, &p.target),
            TaskParams::LoadDimension(p) => (&p.sql, &p.target),
            _ => continue,
        };
        let transform: TransformFn = match target.as_str() {
            "songplays" => songplays,
            "users" => users,
            "songs" => songs,
            "artists" => artists,
            "time" => time,
            other => panic!("no transform for {other}"),
        };
        warehouse.register_transform(sql, transform).unwrap();
    }
    warehouse
}

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

fn field(row: &Row, column: &str) -> Value {
    row.get(column).cloned().unwrap_or(Value::Null)
}

fn plays<'a>(view: &'a TableView<'_>) -> Result<impl Iterator<Item = &'a Row>, WarehouseError> {
    Ok(view
        .rows("staging_events")?
        .iter()
        .filter(|e| e.get("page") == Some(&json!("NextSong"))))
}

fn distinct_by(rows: Vec<Row>, column: &str) -> Vec<Row> {
    let mut seen = Vec::new();
    rows.into_iter()
        .filter(|r| {
            let key = field(r, column);
            if seen.contains(&key) {
                false
            } else {
                seen.push(key);
                true
            }
        })
        .collect()
}

fn songplays(view: &TableView<'_>) -> Result<Vec<Row>, WarehouseError> {
    let songs = view.rows("staging_songs")?;
    Ok(plays(view)?
        .map(|e| {
            let song = songs
                .iter()
                .find(|s| s.get("title") == e.get("song") && s.get("artist_name") == e.get("artist"));
            row(json!({
                "playid": format!("{}-{}", field(e, "sessionid"), field(e, "ts")),
                "start_time": field(e, "ts"),
                "userid": field(e, "userid"),
                "level": field(e, "level"),
                "songid": song.map(|s| field(s, "song_id")).unwrap_or(Value::Null),
                "artistid": song.map(|s| field(s, "artist_id")).unwrap_or(Value::Null),
                "sessionid": field(e, "sessionid"),
                "location": field(e, "location"),
                "user_agent": field(e, "useragent"),
            }))
        })
        .collect())
}

fn users(view: &TableView<'_>) -> Result<Vec<Row>, WarehouseError> {
    let rows = plays(view)?
        .map(|e| {
            row(json!({
                "userid": field(e, "userid"),
                "first_name": field(e, "firstname"),
                "last_name": field(e, "lastname"),
                "gender": field(e, "gender"),
                "level": field(e, "level"),
            }))
        })
        .collect();
    Ok(distinct_by(rows, "userid"))
}

fn songs(view: &TableView<'_>) -> Result<Vec<Row>, WarehouseError> {
    let rows = view
        .rows("staging_songs")?
        .iter()
        .map(|s| {
            row(json!({
                "songid": field(s, "song_id"),
                "title": field(s, "title"),
                "artistid": field(s, "artist_id"),
                "year": field(s, "year"),
                "duration": field(s, "duration"),
            }))
        })
        .collect();
    Ok(distinct_by(rows, "songid"))
}

fn artists(view: &TableView<'_>) -> Result<Vec<Row>, WarehouseError> {
    let rows = view
        .rows("staging_songs")?
        .iter()
        .map(|s| {
            row(json!({
                "artistid": field(s, "artist_id"),
                "name": field(s, "artist_name"),
                "location": field(s, "artist_location"),
                "latitude": field(s, "artist_latitude"),
                "longitude": field(s, "artist_longitude"),
            }))
        })
        .collect();
    Ok(distinct_by(rows, "artistid"))
}

fn time(view: &TableView<'_>) -> Result<Vec<Row>, WarehouseError> {
    let rows = view
        .rows("songplays")?
        .iter()
        .map(|p| row(json!({ "start_time": field(p, "start_time") })))
        .collect();
    Ok(distinct_by(rows, "start_time"))
}
