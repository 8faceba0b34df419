//! Object dependency graph derived from the rule catalogue.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use thiserror::Error;

use crate::rules::RuleSet;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle among {0:?}")]
    Cycle(Vec<String>),
    #[error("{object}.{field} has no known target object type")]
    UnknownReference { object: String, field: String },
    #[error(
        "{object}.{field} requires {target}, which is neither uploaded nor produced by a pre-pass"
    )]
    UnsatisfiedRequired {
        object: String,
        field: String,
        target: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub field: String,
    pub target: String,
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    order: Vec<String>,
    dependencies: HashMap<String, Vec<Dependency>>,
}

impl DependencyGraph {
    pub fn build(rules: &RuleSet) -> Result<Self, GraphError> {
        let catalog = &rules.catalog;
        let index: HashMap<&str, usize> = catalog
            .objects
            .iter()
            .enumerate()
            .map(|(i, o)| (o.name.as_str(), i))
            .collect();

        let mut dependencies: HashMap<String, Vec<Dependency>> = HashMap::new();
        for object in &catalog.objects {
            let produced: BTreeSet<&str> = object
                .prerequisites
                .iter()
                .filter_map(|p| p.produces())
                .collect();
            let deps = dependencies.entry(object.name.clone()).or_default();

            for (field, spec) in &object.references {
                let targets: Vec<String> = if catalog.polymorphic.contains(field) {
                    rules.prefixes.objects().map(str::to_string).collect()
                } else {
                    match spec
                        .object
                        .clone()
                        .or_else(|| catalog.references.get(field).cloned())
                    {
                        Some(target) => vec![target],
                        None => {
                            return Err(GraphError::UnknownReference {
                                object: object.name.clone(),
                                field: field.clone(),
                            })
                        }
                    }
                };
                let polymorphic = targets.len() > 1;

                for target in targets {
                    // Self references resolve against rows mapped earlier in the same pass.
                    if target == object.name {
                        continue;
                    }
                    if index.contains_key(target.as_str()) {
                        deps.push(Dependency {
                            field: field.clone(),
                            target,
                            required: spec.required && !polymorphic,
                        });
                    } else if spec.required && !produced.contains(target.as_str()) {
                        return Err(GraphError::UnsatisfiedRequired {
                            object: object.name.clone(),
                            field: field.clone(),
                            target,
                        });
                    }
                }
            }
        }

        let order = topological_order(rules, &index, &dependencies)?;
        Ok(Self {
            order,
            dependencies,
        })
    }

    /// Upload order: every dependency precedes its dependants, ties keep declaration order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies(&self, object: &str) -> &[Dependency] {
        self.dependencies
            .get(object)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn required_targets(&self, object: &str) -> BTreeSet<&str> {
        self.dependencies(object)
            .iter()
            .filter(|d| d.required)
            .map(|d| d.target.as_str())
            .collect()
    }

    pub fn position(&self, object: &str) -> Option<usize> {
        self.order.iter().position(|o| o == object)
    }
}

fn topological_order(
    rules: &RuleSet,
    index: &HashMap<&str, usize>,
    dependencies: &HashMap<String, Vec<Dependency>>,
) -> Result<Vec<String>, GraphError> {
    let objects = &rules.catalog.objects;
    let mut indegree = vec![0usize; objects.len()];
    let mut dependants: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();

    for (object, deps) in dependencies {
        let Some(&to) = index.get(object.as_str()) else {
            continue;
        };
        let sources: BTreeSet<usize> = deps
            .iter()
            .filter_map(|d| index.get(d.target.as_str()).copied())
            .collect();
        for from in sources {
            if dependants.entry(from).or_default().insert(to) {
                indegree[to] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..objects.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(objects.len());
    while let Some(next) = ready.pop_first() {
        order.push(objects[next].name.clone());
        if let Some(children) = dependants.get(&next) {
            for &child in children {
                indegree[child] -= 1;
                if indegree[child] == 0 {
                    ready.insert(child);
                }
            }
        }
    }

    if order.len() != objects.len() {
        let stuck = objects
            .iter()
            .enumerate()
            .filter(|(i, _)| indegree[*i] > 0)
            .map(|(_, o)| o.name.clone())
            .collect();
        return Err(GraphError::Cycle(stuck));
    }
    Ok(order)
}
