//! リソース依存グラフ
//!
//! 宣言されたリソースをノード、依存関係をエッジとする有向非巡回グラフを構築します。
//! エッジは明示的な `depends_on` と、属性中の参照 `${node.output}` から導出されます。
//! 入力のみに依存する純粋な処理で、副作用はありません。

use crate::error::{Result, SiteError};
use crate::model::{AttrShape, AttrValue, Attributes, DesiredSpec, ResourceKind};
use indexmap::IndexMap;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use tracing::debug;

/// グラフのノード
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub id: String,
    pub kind: ResourceKind,
    pub attributes: Attributes,
    /// 明示的な依存 + 参照から導出された依存
    pub dependencies: BTreeSet<String>,
    /// 宣言順のインデックス
    pub index: usize,
}

/// 依存エッジ: `from` がActiveになるまで `to` は作成・更新を開始できない
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// リソース依存グラフ（構築済みなら非巡回が保証される）
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: IndexMap<String, ResourceNode>,
}

impl ResourceGraph {
    /// desired specからグラフを構築
    ///
    /// スキーマ違反・未知の依存先・未知の出力参照・循環依存はエラーになります。
    pub fn build(spec: &DesiredSpec) -> Result<Self> {
        let mut nodes = IndexMap::new();

        for (index, (id, decl)) in spec.resources.iter().enumerate() {
            validate_schema(id, decl.kind, &decl.attributes)?;

            let mut dependencies = BTreeSet::new();
            for dependency in &decl.depends_on {
                if !spec.resources.contains_key(dependency) {
                    return Err(SiteError::UnknownDependency {
                        node: id.clone(),
                        dependency: dependency.clone(),
                    });
                }
                dependencies.insert(dependency.clone());
            }

            for value in decl.attributes.values() {
                for reference in value.references() {
                    let target = spec.resources.get(&reference.node).ok_or_else(|| {
                        SiteError::UnknownDependency {
                            node: id.clone(),
                            dependency: reference.node.clone(),
                        }
                    })?;
                    if !target.kind.exposes(&reference.output) {
                        return Err(SiteError::UnknownOutput {
                            node: id.clone(),
                            target: reference.node.clone(),
                            output: reference.output.clone(),
                        });
                    }
                    dependencies.insert(reference.node.clone());
                }
            }

            nodes.insert(
                id.clone(),
                ResourceNode {
                    id: id.clone(),
                    kind: decl.kind,
                    attributes: decl.attributes.clone(),
                    dependencies,
                    index,
                },
            );
        }

        let graph = Self { nodes };
        if let Some(cycle) = graph.find_cycle() {
            return Err(SiteError::Cycle(cycle));
        }

        debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges().len(),
            "Built resource graph"
        );
        Ok(graph)
    }

    /// 深さ優先探索（再帰スタック付き）で循環を探す
    ///
    /// 後退辺が見つかった場合、循環に含まれるノード列（先頭ノードを末尾に再掲）を返します。
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InStack,
            Done,
        }

        fn visit<'a>(
            graph: &'a ResourceGraph,
            id: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            marks.insert(id, Mark::InStack);
            stack.push(id);

            for dependency in graph.sorted_dependencies(id) {
                match marks.get(dependency).copied().unwrap_or(Mark::Unvisited) {
                    Mark::InStack => {
                        let start = stack.iter().position(|n| *n == dependency).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[start..].iter().map(|n| n.to_string()).collect();
                        cycle.push(dependency.to_string());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(graph, dependency, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }

            stack.pop();
            marks.insert(id, Mark::Done);
            None
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack = Vec::new();
        for id in self.nodes.keys() {
            if marks.get(id.as_str()).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited
                && let Some(cycle) = visit(self, id, &mut marks, &mut stack)
            {
                return Some(cycle);
            }
        }
        None
    }

    /// 依存先を宣言順で返す
    fn sorted_dependencies(&self, id: &str) -> Vec<&str> {
        let mut deps: Vec<&ResourceNode> = self
            .nodes
            .get(id)
            .map(|n| {
                n.dependencies
                    .iter()
                    .filter_map(|d| self.nodes.get(d))
                    .collect()
            })
            .unwrap_or_default();
        deps.sort_by_key(|n| n.index);
        deps.into_iter().map(|n| n.id.as_str()).collect()
    }

    /// 直接の依存先（宣言順）
    pub fn dependencies_in_order(&self, id: &str) -> Vec<String> {
        self.sorted_dependencies(id)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// トポロジカル順序（同順位は宣言順）
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| (n.id.as_str(), n.dependencies.len()))
            .collect();
        let dependents = self.dependents_index();

        let mut ready: BinaryHeap<Reverse<usize>> = self
            .nodes
            .values()
            .filter(|n| n.dependencies.is_empty())
            .map(|n| Reverse(n.index))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(index)) = ready.pop() {
            let Some((id, _)) = self.nodes.get_index(index) else {
                continue;
            };
            order.push(id.clone());

            for dependent in dependents.get(id.as_str()).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0
                        && let Some(node) = self.nodes.get(*dependent)
                    {
                        ready.push(Reverse(node.index));
                    }
                }
            }
        }
        order
    }

    fn dependents_index(&self) -> HashMap<&str, Vec<&str>> {
        let mut index: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in self.nodes.values() {
            for dependency in &node.dependencies {
                index
                    .entry(dependency.as_str())
                    .or_default()
                    .push(node.id.as_str());
            }
        }
        index
    }

    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// 宣言順のノード
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// すべてのエッジ（依存先 → 依存元）
    pub fn edges(&self) -> Vec<Edge> {
        self.nodes
            .values()
            .flat_map(|n| {
                n.dependencies.iter().map(move |d| Edge {
                    from: d.clone(),
                    to: n.id.clone(),
                })
            })
            .collect()
    }

    /// 直接の依存元
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| n.dependencies.contains(id))
            .map(|n| n.id.as_str())
            .collect()
    }

    /// 推移的な依存元（サブツリー全体）
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let index = self.dependents_index();
        let mut seen = BTreeSet::new();
        let mut queue = vec![id];
        while let Some(current) = queue.pop() {
            for dependent in index.get(current).into_iter().flatten() {
                if seen.insert(dependent.to_string()) {
                    queue.push(*dependent);
                }
            }
        }
        seen
    }

    /// 指定種別のノード
    pub fn nodes_of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values().filter(move |n| n.kind == kind)
    }
}

/// スキーマに照らして属性を検証
fn validate_schema(id: &str, kind: ResourceKind, attributes: &Attributes) -> Result<()> {
    for (name, value) in attributes {
        let schema = kind
            .schema()
            .iter()
            .find(|a| a.name == name.as_str())
            .ok_or_else(|| SiteError::UnknownAttribute {
                node: id.to_string(),
                kind: kind.to_string(),
                attribute: name.clone(),
            })?;

        if schema.shape != AttrShape::Scalar
            && let AttrValue::Literal(literal) = value
            && !literal.is_array()
        {
            return Err(SiteError::InvalidConfig(format!(
                "リソース '{id}' の属性 '{name}' はリストである必要があります"
            )));
        }
    }

    for schema in kind.schema().iter().filter(|a| a.required) {
        if !attributes.contains_key(schema.name) {
            return Err(SiteError::MissingAttribute {
                node: id.to_string(),
                kind: kind.to_string(),
                attribute: schema.name.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> DesiredSpec {
        DesiredSpec::from_value("test", value).unwrap()
    }

    fn record(depends_on: &[&str]) -> serde_json::Value {
        json!({
            "type": "validation-record",
            "attributes": {"zone": "example.com", "name": "_acme", "record_type": "CNAME", "value": "x"},
            "dependsOn": depends_on,
        })
    }

    #[test]
    fn test_reference_implies_edge() {
        let graph = ResourceGraph::build(&spec(json!({
            "bucket": {"type": "object-store", "attributes": {
                "index_document": "index.html", "error_document": "error.html"}},
            "cdn": {"type": "cdn-distribution", "attributes": {
                "origin_domain": "${bucket.regional_domain_name}",
                "default_root_object": "index.html"}},
        })))
        .unwrap();

        assert!(graph.node("cdn").unwrap().dependencies.contains("bucket"));
        assert_eq!(
            graph.edges(),
            vec![Edge {
                from: "bucket".into(),
                to: "cdn".into()
            }]
        );
    }

    #[test]
    fn test_topological_order_breaks_ties_by_declaration() {
        let graph = ResourceGraph::build(&spec(json!({
            "c": record(&["a"]),
            "b": record(&[]),
            "a": record(&[]),
            "d": record(&["c", "b"]),
        })))
        .unwrap();

        assert_eq!(graph.topological_order(), vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn test_every_edge_respects_order() {
        let graph = ResourceGraph::build(&spec(json!({
            "e": record(&["d"]),
            "d": record(&["b", "c"]),
            "c": record(&["a"]),
            "b": record(&["a"]),
            "a": record(&[]),
        })))
        .unwrap();

        let order = graph.topological_order();
        let position = |id: &str| order.iter().position(|n| n == id).unwrap();
        for edge in graph.edges() {
            assert!(position(&edge.from) < position(&edge.to), "{edge:?}");
        }
    }

    #[test]
    fn test_cycle_names_participating_nodes() {
        let err = ResourceGraph::build(&spec(json!({
            "a": record(&["b"]),
            "b": record(&["a"]),
            "c": record(&[]),
        })))
        .unwrap_err();

        let nodes = err.cycle_nodes().unwrap();
        assert!(nodes.contains(&"a".to_string()));
        assert!(nodes.contains(&"b".to_string()));
        assert!(!nodes.contains(&"c".to_string()));
    }

    #[test]
    fn test_cycle_through_references() {
        let err = ResourceGraph::build(&spec(json!({
            "policy": {"type": "access-policy", "attributes": {
                "store": "${bucket.bucket}",
                "grants": [{"principal": "x"}]}},
            "bucket": {"type": "object-store", "attributes": {
                "index_document": "${policy.policy_id}",
                "error_document": "error.html"}},
        })))
        .unwrap_err();
        assert!(matches!(err, SiteError::Cycle(_)));
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let err = ResourceGraph::build(&spec(json!({
            "bucket": {"type": "object-store", "attributes": {
                "index_document": "index.html",
                "error_document": "error.html",
                "website_redirect": "https://example.com"}},
        })))
        .unwrap_err();
        assert!(matches!(err, SiteError::UnknownAttribute { .. }));
    }

    #[test]
    fn test_missing_required_attribute_rejected() {
        let err = ResourceGraph::build(&spec(json!({
            "bucket": {"type": "object-store", "attributes": {"index_document": "index.html"}},
        })))
        .unwrap_err();
        assert!(matches!(err, SiteError::MissingAttribute { ref attribute, .. } if attribute == "error_document"));
    }

    #[test]
    fn test_unknown_output_rejected() {
        let err = ResourceGraph::build(&spec(json!({
            "bucket": {"type": "object-store", "attributes": {
                "index_document": "index.html", "error_document": "error.html"}},
            "cdn": {"type": "cdn-distribution", "attributes": {
                "origin_domain": "${bucket.website_endpoint}",
                "default_root_object": "index.html"}},
        })))
        .unwrap_err();
        assert!(matches!(err, SiteError::UnknownOutput { .. }));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let err = ResourceGraph::build(&spec(json!({"a": record(&["ghost"])}))).unwrap_err();
        assert!(matches!(err, SiteError::UnknownDependency { .. }));
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = ResourceGraph::build(&spec(json!({
            "a": record(&[]),
            "b": record(&["a"]),
            "c": record(&["b"]),
            "d": record(&[]),
        })))
        .unwrap();

        let subtree = graph.transitive_dependents("a");
        assert_eq!(subtree.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(graph.dependents("a"), vec!["b"]);
    }
}
