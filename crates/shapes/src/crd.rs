//! CustomResourceDefinitions for the shape kinds, with the status subresource
//! enabled so status writes go through `/status`.

use std::collections::BTreeMap;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceColumnDefinition, CustomResourceDefinition, CustomResourceDefinitionNames,
    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion, CustomResourceSubresourceStatus,
    CustomResourceSubresources, CustomResourceValidation, JSONSchemaProps,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use koil_core::ResourceKind;

fn number(minimum: Option<f64>) -> JSONSchemaProps {
    JSONSchemaProps { type_: Some("number".into()), format: Some("float".into()), minimum, ..Default::default() }
}

fn object(props: impl IntoIterator<Item = (&'static str, JSONSchemaProps)>) -> JSONSchemaProps {
    JSONSchemaProps {
        type_: Some("object".into()),
        properties: Some(props.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<BTreeMap<_, _>>()),
        ..Default::default()
    }
}

/// The CRD for one shape kind; `None` for kinds this crate does not define.
pub fn crd_for(kind: &ResourceKind) -> Option<CustomResourceDefinition> {
    if kind.group != crate::GROUP || kind.version != crate::VERSION {
        return None;
    }
    let spec_field = match kind.kind.as_str() {
        "Circle" => "radius",
        "Square" => "width",
        _ => return None,
    };
    let singular = kind.kind.to_lowercase();
    let plural = format!("{singular}s");
    let schema = object([
        ("spec", object([(spec_field, number(Some(0.0)))])),
        ("status", object([("area", number(None))])),
    ]);
    let version = CustomResourceDefinitionVersion {
        name: kind.version.clone(),
        served: true,
        storage: true,
        schema: Some(CustomResourceValidation { open_api_v3_schema: Some(schema) }),
        subresources: Some(CustomResourceSubresources {
            status: Some(CustomResourceSubresourceStatus(serde_json::json!({}))),
            ..Default::default()
        }),
        additional_printer_columns: Some(vec![CustomResourceColumnDefinition {
            name: "Area".into(),
            type_: "number".into(),
            json_path: ".status.area".into(),
            ..Default::default()
        }]),
        ..Default::default()
    };
    Some(CustomResourceDefinition {
        metadata: ObjectMeta { name: Some(format!("{plural}.{}", kind.group)), ..Default::default() },
        spec: CustomResourceDefinitionSpec {
            group: kind.group.clone(),
            names: CustomResourceDefinitionNames {
                kind: kind.kind.clone(),
                plural,
                singular: Some(singular),
                list_kind: Some(format!("{}List", kind.kind)),
                ..Default::default()
            },
            scope: "Namespaced".into(),
            versions: vec![version],
            ..Default::default()
        },
        status: None,
    })
}

/// CRDs for every kind in `crate::kinds()`.
pub fn crds() -> Vec<CustomResourceDefinition> {
    crate::kinds().iter().filter_map(crd_for).collect()
}
