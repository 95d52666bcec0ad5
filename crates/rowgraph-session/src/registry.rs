//! Record types, association descriptors and polymorphic type tables.
//!
//! The registry is filled once at startup and then shared read-only by every
//! session. [`Registry::associate`] is where descriptors are validated: key
//! arity, missing keys and missing join tables are reported there, before
//! any load runs.

use crate::association::{AssociationDescriptor, AssociationKind};
use rowgraph_core::error::{AssociationErrorKind, ConfigErrorKind};
use rowgraph_core::{Error, ModelInfo, Result, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Registered types and their associations.
#[derive(Debug, Default)]
pub struct Registry {
    models: HashMap<&'static str, ModelInfo>,
    associations: HashMap<&'static str, Vec<Arc<AssociationDescriptor>>>,
    polymorphic: HashMap<&'static str, Vec<(Value, &'static str)>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record type.
    pub fn register(&mut self, model: ModelInfo) -> &mut Self {
        self.models.insert(model.name, model);
        self
    }

    /// Declare an association on `owner`.
    ///
    /// Default keys are filled in from primary keys, then the descriptor is
    /// checked:
    ///
    /// - the owner and (for non-custom loaders) the target must be registered
    /// - to-one needs a local key, to-many a foreign key
    /// - many-to-many needs a join table with non-empty key columns
    /// - key column counts must agree on both sides
    /// - the name must be new for the owner
    pub fn associate(
        &mut self,
        owner: &'static str,
        mut descriptor: AssociationDescriptor,
    ) -> Result<&mut Self> {
        let owner_model = *self.model(owner)?;
        descriptor.owner = owner;

        if self.association(owner, descriptor.name).is_ok() {
            return Err(Error::config(
                ConfigErrorKind::DuplicateAssociation,
                format!("{owner}.{} is already declared", descriptor.name),
            ));
        }

        let target_model = match descriptor.target {
            Some(target) => Some(*self.model(target)?),
            None => None,
        };

        if descriptor.is_custom() {
            Self::fill_custom_keys(&mut descriptor, &owner_model, target_model.as_ref());
        } else {
            let Some(target_model) = target_model else {
                return Err(Error::config(
                    ConfigErrorKind::UnknownType,
                    format!("{owner}.{} has no target type", descriptor.name),
                ));
            };
            Self::fill_and_check_keys(&mut descriptor, &owner_model, &target_model)?;
        }

        tracing::debug!(
            owner = owner,
            association = descriptor.name,
            kind = descriptor.kind.as_str(),
            target = descriptor.target.unwrap_or("<dynamic>"),
            custom = descriptor.is_custom(),
            "Declared association"
        );

        self.associations
            .entry(owner)
            .or_default()
            .push(Arc::new(descriptor));
        Ok(self)
    }

    fn fill_custom_keys(
        descriptor: &mut AssociationDescriptor,
        owner: &ModelInfo,
        target: Option<&ModelInfo>,
    ) {
        if descriptor.owner_key.is_empty() {
            descriptor.owner_key = owner.primary_key;
        }
        if descriptor.target_key.is_empty() {
            if let Some(target) = target {
                descriptor.target_key = target.primary_key;
            }
        }
    }

    fn fill_and_check_keys(
        descriptor: &mut AssociationDescriptor,
        owner: &ModelInfo,
        target: &ModelInfo,
    ) -> Result<()> {
        let label = format!("{}.{}", owner.name, descriptor.name);
        let missing = |what: &str| {
            Error::config(
                ConfigErrorKind::MissingKey,
                format!("{label}: {what} must name at least one column"),
            )
        };

        match descriptor.kind {
            AssociationKind::ToOne => {
                if descriptor.owner_key.is_empty() {
                    return Err(missing("local key"));
                }
                if descriptor.target_key.is_empty() {
                    descriptor.target_key = target.primary_key;
                }
            }
            AssociationKind::ToMany => {
                if descriptor.target_key.is_empty() {
                    return Err(missing("foreign key"));
                }
                if descriptor.owner_key.is_empty() {
                    descriptor.owner_key = owner.primary_key;
                }
            }
            AssociationKind::ManyToMany => {
                let Some(join) = descriptor.join_table else {
                    return Err(Error::config(
                        ConfigErrorKind::MissingJoinTable,
                        format!("{label}: many-to-many association needs a join table"),
                    ));
                };
                if join.owner_columns.is_empty() || join.target_columns.is_empty() {
                    return Err(missing("join table key"));
                }
                if descriptor.owner_key.is_empty() {
                    descriptor.owner_key = owner.primary_key;
                }
                if descriptor.target_key.is_empty() {
                    descriptor.target_key = target.primary_key;
                }
                if join.owner_columns.len() != descriptor.owner_key.len() {
                    return Err(arity_error(
                        &label,
                        "join table owner columns",
                        join.owner_columns.len(),
                        descriptor.owner_key.len(),
                    ));
                }
                if join.target_columns.len() != descriptor.target_key.len() {
                    return Err(arity_error(
                        &label,
                        "join table target columns",
                        join.target_columns.len(),
                        descriptor.target_key.len(),
                    ));
                }
                return Ok(());
            }
            AssociationKind::Scalar => {
                return Err(Error::config(
                    ConfigErrorKind::Unsupported,
                    format!("{label}: scalar associations need a custom loader"),
                ));
            }
        }

        if descriptor.owner_key.len() != descriptor.target_key.len() {
            return Err(arity_error(
                &label,
                "owner key",
                descriptor.owner_key.len(),
                descriptor.target_key.len(),
            ));
        }
        Ok(())
    }

    /// Declare a discriminator → type table for polymorphic associations.
    pub fn polymorphic<I, V>(&mut self, name: &'static str, pairs: I) -> &mut Self
    where
        I: IntoIterator<Item = (V, &'static str)>,
        V: Into<Value>,
    {
        self.polymorphic
            .insert(name, pairs.into_iter().map(|(v, t)| (v.into(), t)).collect());
        self
    }

    /// Look up a registered type.
    pub fn model(&self, name: &str) -> Result<&ModelInfo> {
        self.models.get(name).ok_or_else(|| {
            Error::config(
                ConfigErrorKind::UnknownType,
                format!("type '{name}' is not registered"),
            )
        })
    }

    /// Look up an association declared on `owner`.
    pub fn association(&self, owner: &str, name: &str) -> Result<&Arc<AssociationDescriptor>> {
        self.associations
            .get(owner)
            .and_then(|list| list.iter().find(|d| d.name == name))
            .ok_or_else(|| {
                Error::config(
                    ConfigErrorKind::UnknownAssociation,
                    format!("association '{name}' is not declared on '{owner}'"),
                )
            })
    }

    /// Association names declared on `owner`, in declaration order.
    pub fn associations_of(&self, owner: &str) -> Vec<&'static str> {
        self.associations
            .get(owner)
            .map(|list| list.iter().map(|d| d.name).collect())
            .unwrap_or_default()
    }

    /// Resolve a polymorphic discriminator to a registered type.
    pub fn resolve_polymorphic(
        &self,
        table: &str,
        discriminator: &Value,
        owner: &str,
        association: &str,
    ) -> Result<&ModelInfo> {
        let unknown = || {
            Error::association(
                AssociationErrorKind::UnknownPolymorphicType,
                owner,
                association,
                format!("discriminator {discriminator:?} does not name a type in '{table}'"),
            )
        };
        let type_name = self
            .polymorphic
            .get(table)
            .and_then(|pairs| {
                pairs
                    .iter()
                    .find(|(value, _)| value.sql_eq(discriminator))
                    .map(|(_, t)| *t)
            })
            .ok_or_else(unknown)?;
        self.models.get(type_name).ok_or_else(unknown)
    }
}

fn arity_error(label: &str, what: &str, found: usize, expected: usize) -> Error {
    Error::config(
        ConfigErrorKind::KeyArity,
        format!("{label}: {what} has {found} column(s), the matching key has {expected}"),
    )
}
