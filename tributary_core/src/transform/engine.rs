use crate::entities::models::{Entity, EntityKey};
use crate::transform::models::{DagSpec, StageKind};
use crate::transform::stages::{DropFields, ExplodeArray, SelectFields, TextChunker};
use crate::transform::traits::{Stage, StageContext, StageFactory};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Factories for `StageKind::Custom` handlers.
#[derive(Default, Clone)]
pub struct StageRegistry {
    factories: HashMap<String, Arc<dyn StageFactory>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn StageFactory>) -> Result<()> {
        let key = factory.handler().to_string();
        if self.factories.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "stage handler '{key}' already registered"
            )));
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    fn build(&self, kind: &StageKind) -> Result<Arc<dyn Stage>> {
        Ok(match kind {
            StageKind::TextChunker {
                field,
                max_chars,
                overlap,
                chunk_type,
                emit_parent,
            } => Arc::new(TextChunker {
                field: field.clone(),
                max_chars: *max_chars,
                overlap: *overlap,
                chunk_type: chunk_type.clone(),
                emit_parent: *emit_parent,
            }),
            StageKind::SelectFields { fields } => Arc::new(SelectFields {
                fields: fields.clone(),
            }),
            StageKind::DropFields { fields } => Arc::new(DropFields {
                fields: fields.clone(),
            }),
            StageKind::ExplodeArray {
                field,
                child_type,
                id_field,
            } => Arc::new(ExplodeArray {
                field: field.clone(),
                child_type: child_type.clone(),
                id_field: id_field.clone(),
            }),
            StageKind::Custom { handler, config } => self
                .factories
                .get(handler)
                .ok_or_else(|| {
                    Error::NotFound(format!("stage handler '{handler}' not registered"))
                })?
                .build(config)?,
        })
    }
}

struct CompiledStage {
    name: String,
    applies_to: HashSet<String>,
    /// Position of the upstream stage in `TransformerDag::stages`.
    upstream: Option<usize>,
    leaf: bool,
    stage: Arc<dyn Stage>,
}

impl CompiledStage {
    fn applies(&self, e: &Entity) -> bool {
        self.applies_to.is_empty() || self.applies_to.contains(&e.entity_type)
    }
}

/// Validated, topologically ordered stage graph.
pub struct TransformerDag {
    stages: Vec<CompiledStage>,
}

impl std::fmt::Debug for TransformerDag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerDag")
            .field("order", &self.order())
            .finish()
    }
}

impl TransformerDag {
    /// The identity DAG: every entity passes through unchanged.
    pub fn identity() -> Self {
        Self { stages: Vec::new() }
    }

    /// Validate names, upstream references and acyclicity, then resolve stage implementations.
    #[tracing::instrument(level = "debug", skip_all, fields(stages = spec.stages.len()))]
    pub fn compile(spec: &DagSpec, registry: &StageRegistry) -> Result<Self> {
        let order = topo_sort(spec)?;

        let mut position: HashMap<&str, usize> = HashMap::new();
        for (pos, &idx) in order.iter().enumerate() {
            position.insert(spec.stages[idx].name.as_str(), pos);
        }
        let has_children: HashSet<&str> = spec
            .stages
            .iter()
            .filter_map(|s| s.upstream.as_deref())
            .collect();

        let mut stages = Vec::with_capacity(order.len());
        for &idx in &order {
            let s = &spec.stages[idx];
            s.op.validate(&s.name)?;
            stages.push(CompiledStage {
                name: s.name.clone(),
                applies_to: s.applies_to.iter().cloned().collect(),
                upstream: s.upstream.as_deref().and_then(|u| position.get(u).copied()),
                leaf: !has_children.contains(s.name.as_str()),
                stage: registry.build(&s.op)?,
            });
        }
        Ok(Self { stages })
    }

    /// Stage names in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Run one normalized entity through every stage.
    ///
    /// Returns the outputs of the leaf stages, de-duplicated by key, with hashes
    /// recomputed and the lineage root stamped. Any stage failure fails the whole
    /// lineage so nothing derived from `root` is committed.
    pub fn run(&self, root: &Entity) -> Result<Vec<Entity>> {
        if self.stages.is_empty() {
            return Ok(vec![root.clone()]);
        }

        let mut produced: Vec<Vec<Entity>> = Vec::with_capacity(self.stages.len());
        for pos in 0..self.stages.len() {
            let out = self.run_stage(pos, root, &produced)?;
            produced.push(out);
        }

        let mut seen: BTreeMap<EntityKey, String> = BTreeMap::new();
        let mut outputs = Vec::new();
        for (pos, st) in self.stages.iter().enumerate() {
            if !st.leaf {
                continue;
            }
            for e in &produced[pos] {
                match seen.get(&e.key()) {
                    Some(hash) if *hash == e.content_hash => continue,
                    Some(_) => {
                        return Err(Error::stage(
                            &st.name,
                            format!("conflicting outputs for {}", e.key()),
                        ))
                    }
                    None => {
                        seen.insert(e.key(), e.content_hash.clone());
                        outputs.push(e.clone());
                    }
                }
            }
        }
        Ok(outputs)
    }

    fn run_stage(&self, pos: usize, root: &Entity, produced: &[Vec<Entity>]) -> Result<Vec<Entity>> {
        let st = &self.stages[pos];
        let inputs: &[Entity] = match st.upstream {
            Some(u) => &produced[u],
            None => std::slice::from_ref(root),
        };

        let mut ancestors = Vec::new();
        let mut cursor = st.upstream;
        while let Some(u) = cursor {
            ancestors.push((self.stages[u].name.as_str(), produced[u].as_slice()));
            cursor = self.stages[u].upstream;
        }
        let ctx = StageContext {
            stage: &st.name,
            root,
            ancestors,
        };

        let root_key = root.key();
        let mut out = Vec::new();
        for input in inputs {
            if !st.applies(input) {
                out.push(input.clone());
                continue;
            }
            let emitted = st.stage.apply(input, &ctx).map_err(|e| match e {
                Error::StageFailure { message, .. } => Error::stage(&st.name, message),
                other => Error::stage(&st.name, other.to_string()),
            })?;
            for mut e in emitted {
                if e.entity_type.trim().is_empty() || e.entity_id.trim().is_empty() {
                    return Err(Error::stage(&st.name, "emitted an entity without identity"));
                }
                e.lineage_root = root_key.clone();
                e.rehash();
                out.push(e);
            }
        }
        Ok(out)
    }
}

/// Kahn's algorithm; ties resolve by declaration order so the result is stable.
#[tracing::instrument(level = "debug", skip(spec))]
pub fn topo_sort(spec: &DagSpec) -> Result<Vec<usize>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, s) in spec.stages.iter().enumerate() {
        if s.name.trim().is_empty() {
            return Err(Error::InvalidInput("stage name is empty".to_string()));
        }
        if index.insert(s.name.as_str(), i).is_some() {
            return Err(Error::InvalidInput(format!(
                "duplicate stage name: {}",
                s.name
            )));
        }
    }

    let mut indegree = vec![0usize; spec.stages.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); spec.stages.len()];
    for (i, s) in spec.stages.iter().enumerate() {
        if let Some(up) = &s.upstream {
            let Some(&u) = index.get(up.as_str()) else {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' has unknown upstream '{}'",
                    s.name, up
                )));
            };
            if u == i {
                return Err(Error::InvalidInput(format!(
                    "stage '{}' cannot be its own upstream",
                    s.name
                )));
            }
            indegree[i] += 1;
            children[u].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut out = Vec::with_capacity(spec.stages.len());
    while let Some(i) = ready.pop_first() {
        out.push(i);
        for &c in &children[i] {
            indegree[c] -= 1;
            if indegree[c] == 0 {
                ready.insert(c);
            }
        }
    }

    if out.len() != spec.stages.len() {
        return Err(Error::InvalidInput("dag contains a cycle".to_string()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::models::{Breadcrumb, FieldValue};
    use crate::transform::models::StageSpec;

    fn doc(body: &str) -> Entity {
        let mut e = Entity {
            entity_id: "D1".into(),
            entity_type: "doc".into(),
            payload: [
                ("title".to_string(), FieldValue::String("Readme".into())),
                ("body".to_string(), FieldValue::String(body.into())),
            ]
            .into_iter()
            .collect(),
            source_updated_at: None,
            content_hash: String::new(),
            breadcrumbs: vec![Breadcrumb::new("repo", "R1")],
            lineage_root: EntityKey::new("doc", "D1"),
            hash_exclude: vec![],
        };
        e.rehash();
        e
    }

    fn chunker(name: &str) -> StageSpec {
        StageSpec::new(
            name,
            StageKind::TextChunker {
                field: "body".into(),
                max_chars: 8,
                overlap: 0,
                chunk_type: None,
                emit_parent: true,
            },
        )
    }

    struct Boom;
    impl Stage for Boom {
        fn apply(&self, input: &Entity, _ctx: &StageContext<'_>) -> Result<Vec<Entity>> {
            if input.entity_id.contains("bad") {
                return Err(Error::InvalidInput("cannot handle".into()));
            }
            Ok(vec![input.clone()])
        }
    }

    struct BoomFactory;
    impl StageFactory for BoomFactory {
        fn handler(&self) -> &'static str {
            "boom"
        }
        fn build(&self, _config: &serde_json::Value) -> Result<Arc<dyn Stage>> {
            Ok(Arc::new(Boom))
        }
    }

    /// Records which ancestor outputs it could see.
    struct Peek;
    impl Stage for Peek {
        fn apply(&self, input: &Entity, ctx: &StageContext<'_>) -> Result<Vec<Entity>> {
            let mut e = input.clone();
            let seen = ctx.upstream_outputs("chunk").map(|o| o.len()).unwrap_or(0);
            e.payload
                .insert("seen_chunk_outputs".into(), FieldValue::Integer(seen as i64));
            e.payload.insert(
                "root".into(),
                FieldValue::String(ctx.root().entity_id.clone()),
            );
            Ok(vec![e])
        }
    }

    struct PeekFactory;
    impl StageFactory for PeekFactory {
        fn handler(&self) -> &'static str {
            "peek"
        }
        fn build(&self, _config: &serde_json::Value) -> Result<Arc<dyn Stage>> {
            Ok(Arc::new(Peek))
        }
    }

    fn custom(name: &str, handler: &str) -> StageSpec {
        StageSpec::new(
            name,
            StageKind::Custom {
                handler: handler.into(),
                config: serde_json::Value::Null,
            },
        )
    }

    fn registry() -> StageRegistry {
        let mut r = StageRegistry::new();
        r.register(Arc::new(BoomFactory)).unwrap();
        r.register(Arc::new(PeekFactory)).unwrap();
        r
    }

    #[test]
    fn empty_dag_is_identity() {
        let e = doc("hello");
        let out = TransformerDag::identity().run(&e).unwrap();
        assert_eq!(out, vec![e]);
    }

    #[test]
    fn rejects_cycles_unknown_upstreams_and_duplicates() {
        let cyclic = DagSpec {
            stages: vec![chunker("a").after("b"), chunker("b").after("a")],
        };
        assert!(TransformerDag::compile(&cyclic, &registry()).is_err());

        let unknown = DagSpec {
            stages: vec![chunker("a").after("zzz")],
        };
        assert!(TransformerDag::compile(&unknown, &registry()).is_err());

        let dup = DagSpec {
            stages: vec![chunker("a"), chunker("a")],
        };
        assert!(TransformerDag::compile(&dup, &registry()).is_err());

        let missing_handler = DagSpec {
            stages: vec![custom("x", "nope")],
        };
        assert!(matches!(
            TransformerDag::compile(&missing_handler, &registry()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn topo_order_is_stable_by_declaration() {
        let spec = DagSpec {
            stages: vec![
                custom("late", "peek").after("chunk"),
                chunker("chunk"),
                custom("side", "boom"),
            ],
        };
        let dag = TransformerDag::compile(&spec, &registry()).unwrap();
        assert_eq!(dag.order(), vec!["chunk", "late", "side"]);
    }

    #[test]
    fn fan_out_then_chain_sees_ancestor_outputs() {
        let spec = DagSpec {
            stages: vec![chunker("chunk"), custom("peek", "peek").after("chunk")],
        };
        let dag = TransformerDag::compile(&spec, &registry()).unwrap();
        let root = doc("aaaa bbbb cccc");
        let out = dag.run(&root).unwrap();
        // Parent + 3 chunks, all from the leaf stage.
        assert_eq!(out.len(), 4);
        for e in &out {
            assert_eq!(e.lineage_root, root.key());
            assert_eq!(
                e.payload.get("seen_chunk_outputs"),
                Some(&FieldValue::Integer(4))
            );
            assert_eq!(e.payload.get("root"), Some(&FieldValue::String("D1".into())));
        }
    }

    #[test]
    fn output_is_deterministic() {
        let spec = DagSpec {
            stages: vec![chunker("chunk"), custom("peek", "peek").after("chunk")],
        };
        let dag = TransformerDag::compile(&spec, &registry()).unwrap();
        let root = doc("the quick brown fox jumps over the lazy dog");
        let a = dag.run(&root).unwrap();
        let b = dag.run(&root).unwrap();
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
    }

    #[test]
    fn stage_failure_fails_whole_lineage_and_names_stage() {
        let spec = DagSpec {
            stages: vec![custom("explode", "boom")],
        };
        let dag = TransformerDag::compile(&spec, &registry()).unwrap();
        let mut bad = doc("x");
        bad.entity_id = "bad-1".into();
        match dag.run(&bad) {
            Err(Error::StageFailure { stage, .. }) => assert_eq!(stage, "explode"),
            other => panic!("expected stage failure, got {other:?}"),
        }
        assert_eq!(dag.run(&doc("x")).unwrap().len(), 1);
    }

    #[test]
    fn applies_to_filters_entity_types() {
        let spec = DagSpec {
            stages: vec![chunker("chunk").only("other_type")],
        };
        let dag = TransformerDag::compile(&spec, &registry()).unwrap();
        let root = doc("aaaa bbbb cccc");
        assert_eq!(dag.run(&root).unwrap(), vec![root]);
    }

    #[test]
    fn parallel_roots_deduplicate_identical_passthroughs() {
        let spec = DagSpec {
            stages: vec![
                chunker("chunk").only("other_type"),
                custom("side", "boom"),
            ],
        };
        let dag = TransformerDag::compile(&spec, &registry()).unwrap();
        let root = doc("x");
        assert_eq!(dag.run(&root).unwrap().len(), 1);
    }
}
