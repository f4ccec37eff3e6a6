use serde::Deserialize;

use konduit_core::{ConfigError, Pipeline, PipelineError, PipelineOptions, ValveCatalog};

/// 声明式管线清单。
///
/// # 教案式说明
/// - **意图（Why）**：部署侧以 TOML 描述“用哪些 Stage、是否立即打开”，Stage 本身由宿主代码注册到
///   [`ValveCatalog`]，清单只引用名称；
/// - **契约（What）**：
///   - 顶层除 `stages` 与 `open` 外的键均按 [`PipelineOptions`] 解释，未知键（包括拼写错误）直接失败；
///   - `stages` 按声明顺序装配，未注册的名称在 [`DefaultPipelineFactory::build`] 时返回
///     [`PipelineError::InvalidStage`]；
///   - `open` 缺省为 `false`。
///
/// ```toml
/// stages = ["normalize", "enrich"]
/// open = true
/// channel_capacity = 32
///
/// [relay]
/// namespace = "com.example.activity"
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(try_from = "toml::Table")]
pub struct PipelineManifest {
    pub stages: Vec<String>,
    pub open: bool,
    pub options: PipelineOptions,
}

impl PipelineManifest {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

/// 先摘出清单自身的键，剩余部分整体交给 [`PipelineOptions`]，由其拒绝未知字段。
impl TryFrom<toml::Table> for PipelineManifest {
    type Error = ConfigError;

    fn try_from(mut table: toml::Table) -> Result<Self, Self::Error> {
        let stages = match table.remove("stages") {
            Some(value) => value.try_into::<Vec<String>>().map_err(parse_error)?,
            None => Vec::new(),
        };
        let open = match table.remove("open") {
            Some(value) => value.try_into::<bool>().map_err(parse_error)?,
            None => false,
        };
        let options = toml::Value::Table(table)
            .try_into::<PipelineOptions>()
            .map_err(parse_error)?;
        Ok(Self {
            stages,
            open,
            options,
        })
    }
}

fn parse_error(err: toml::de::Error) -> ConfigError {
    ConfigError::Parse(err.to_string())
}

/// `DefaultPipelineFactory` 把 [`ValveCatalog`]、宿主提供的基础选项与清单聚合为可直接投入使用的
/// [`Pipeline`]。
///
/// # 教案级说明
/// - **执行逻辑（How）**：
///   1. 基础选项与清单选项深度合并（清单优先），并注入目录；
///   2. 构造管线，按 `stages` 顺序解析并注册 Stage；
///   3. `open = true` 时立即打开；
/// - **风险与权衡（Trade-offs）**：中途失败时已创建的管线直接丢弃，不做部分回滚；总线订阅随之失效。
#[derive(Clone, Debug, Default)]
pub struct DefaultPipelineFactory {
    catalog: ValveCatalog,
    base: PipelineOptions,
}

impl DefaultPipelineFactory {
    pub fn new(catalog: ValveCatalog) -> Self {
        Self {
            catalog,
            base: PipelineOptions::default(),
        }
    }

    /// 设置基础选项（日志、中继总线等只能以代码注入的能力通常放在这里）。
    pub fn with_options(mut self, base: PipelineOptions) -> Self {
        self.base = base;
        self
    }

    pub fn build(&self, manifest: &PipelineManifest) -> Result<Pipeline, PipelineError> {
        let options = self
            .base
            .clone()
            .merge(manifest.options.clone())
            .with_catalog(self.catalog.clone());
        let pipeline = Pipeline::new(options)?;

        for stage in &manifest.stages {
            pipeline.use_named(stage)?;
        }
        if manifest.open {
            pipeline.open()?;
        }

        tracing::debug!(
            target: "konduit::factory",
            stages = manifest.stages.len(),
            opened = manifest.open,
            namespace = pipeline.namespace(),
            "pipeline assembled from manifest"
        );
        Ok(pipeline)
    }

    pub fn build_from_toml(&self, source: &str) -> Result<Pipeline, PipelineError> {
        let manifest = PipelineManifest::from_toml_str(source)?;
        self.build(&manifest)
    }
}
