// #[cfg(test)]
pub mod reconciler {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use http::{Method, Request, Response};
    use hyper::{body::to_bytes, Body};
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use kube::{core::ObjectMeta, discovery::ApiResource, Client, Resource, ResourceExt};
    use serde::{de::DeserializeOwned, Serialize};

    use crate::{
        controller::{error::Error, provider::BackupProvider},
        crd::{
            backup::{
                KuberlogicServiceBackup, KuberlogicServiceBackupSpec,
                KUBERLOGIC_SERVICE_BACKUP_FINALIZER,
            },
            backup_schedule::{KuberlogicServiceBackupSchedule, KuberlogicServiceBackupScheduleSpec},
            phase::Phase,
            restore::{KuberlogicServiceRestore, KuberlogicServiceRestoreSpec},
            service::{KuberLogicService, KuberLogicServiceSpec, KuberLogicServiceStatus},
            velero::{Backup, BackupSpec},
        },
    };

    pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    pub struct ApiServerVerifier(pub ApiServerHandle);

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    pub fn mock_client() -> (Client, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        (
            Client::new(mock_service, "default"),
            ApiServerVerifier(handle),
        )
    }

    pub fn ok_response(body: Vec<u8>) -> Response<Body> {
        Response::builder().body(Body::from(body)).unwrap()
    }

    impl ApiServerVerifier {
        async fn expect<T: Resource<DynamicType = ()>>(
            &mut self,
            res: &T,
            method: Method,
            subresource: Option<&str>,
            list: bool,
        ) -> (
            Vec<u8>,
            tower_test::mock::SendResponse<Response<Body>>,
        ) {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_resource_request(&request, res, subresource, list, None, method);
            let body = to_bytes(request.into_body()).await.unwrap();
            (body.to_vec(), send)
        }

        pub async fn handle_get<T: Resource<DynamicType = ()> + Serialize>(&mut self, res: &T) {
            let (_, send) = self.expect(res, Method::GET, None, false).await;
            send.send_response(ok_response(api_server_response_resource(res)));
        }

        pub async fn handle_get_not_found<T: Resource<DynamicType = ()>>(&mut self, res: &T) {
            let (_, send) = self.expect(res, Method::GET, None, false).await;
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(api_server_response_not_found(res)))
                    .unwrap(),
            );
        }

        /// `res` only locates the collection.
        pub async fn handle_list<T: Resource<DynamicType = ()>>(&mut self, res: &T, body: Vec<u8>) {
            let (_, send) = self.expect(res, Method::GET, None, true).await;
            send.send_response(ok_response(body));
        }

        /// Echo the replaced status and return the object sent.
        pub async fn handle_status_update<T>(&mut self, res: &T) -> T
        where
            T: Resource<DynamicType = ()> + DeserializeOwned,
        {
            let (body, send) = self.expect(res, Method::PUT, Some("status"), false).await;
            let updated = serde_json::from_slice(&body).unwrap();
            send.send_response(ok_response(body));
            updated
        }

        /// Echo the created object and return it.
        pub async fn handle_create<T>(&mut self, res: &T) -> T
        where
            T: Resource<DynamicType = ()> + DeserializeOwned,
        {
            let (body, send) = self.expect(res, Method::POST, None, false).await;
            let created = serde_json::from_slice(&body).unwrap();
            send.send_response(ok_response(body));
            created
        }

        /// Answer with `res` and return the patch sent.
        pub async fn handle_patch<T: Resource<DynamicType = ()> + Serialize>(
            &mut self,
            res: &T,
        ) -> serde_json::Value {
            let (body, send) = self.expect(res, Method::PATCH, None, false).await;
            send.send_response(ok_response(api_server_response_resource(res)));
            serde_json::from_slice(&body).unwrap()
        }

        /// Answer with `response` and return the delete options sent.
        pub async fn handle_delete<T: Resource<DynamicType = ()>>(
            &mut self,
            res: &T,
            collection: bool,
            response: Vec<u8>,
        ) -> serde_json::Value {
            let (body, send) = self.expect(res, Method::DELETE, None, collection).await;
            send.send_response(ok_response(response));
            if body.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&body).unwrap()
            }
        }
    }

    pub fn api_server_response_status_success() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Success",
        }))
        .unwrap()
    }

    fn base_uri<T: Resource<DynamicType = ()>>() -> String {
        let api_resource = ApiResource::erase::<T>(&());
        if api_resource.group.is_empty() {
            format!("/api/{}", api_resource.api_version)
        } else {
            format!("/apis/{}", api_resource.api_version)
        }
    }

    fn collection_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        match res.namespace() {
            Some(ns) => format!(
                "{}/namespaces/{}/{}",
                base_uri::<T>(),
                ns,
                api_resource.plural
            ),
            None => format!("{}/{}", base_uri::<T>(), api_resource.plural),
        }
    }

    pub fn get_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}/{}", collection_uri(res), res.name_any())
    }

    pub fn post_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}?", collection_uri(res))
    }

    pub fn put_uri<T: Resource<DynamicType = ()>>(res: &T, subresource: Option<&str>) -> String {
        let sub = match subresource {
            Some(s) => format!("/{s}"),
            None => String::new(),
        };
        format!("{}{}?", get_uri(res), sub)
    }

    fn list_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}?", collection_uri(res))
    }

    fn patch_uri<T: Resource<DynamicType = ()>>(res: &T) -> String {
        format!("{}?", get_uri(res))
    }

    pub fn assert_resource_request<T: Resource<DynamicType = ()>>(
        request: &Request<Body>,
        res: &T,
        subresource: Option<&str>,
        list: bool,
        label_selector: Option<String>,
        method: http::Method,
    ) {
        assert_eq!(request.method(), method);
        let uri = match method {
            http::Method::GET | http::Method::DELETE if list => list_uri(res),
            http::Method::GET => get_uri(res),
            http::Method::POST => post_uri(res),
            http::Method::PUT => put_uri(res, subresource),
            http::Method::PATCH | http::Method::DELETE => patch_uri(res),
            _ => panic!("unimplemented method"),
        };
        let uri = if let Some(selector) = label_selector {
            format!("{uri}{}", selector)
        } else {
            uri
        };
        assert_eq!(request.uri().to_string(), uri);
    }

    pub fn api_server_response_not_found<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        let (group_kind, details) = if api_resource.group.is_empty() {
            (api_resource.plural.clone(), String::new())
        } else {
            (
                format!("{}.{}", api_resource.plural, api_resource.group),
                format!(r#""group": "{}","#, api_resource.group),
            )
        };
        format!(
            r#"{{
  "kind": "Status",
  "apiVersion": "v1",
  "metadata": {{}},
  "status": "Failure",
  "message": "{} \"{}\" not found",
  "reason": "NotFound",
  "details": {{
    "name": "{}",
    {}
    "kind": "{}"
  }},
  "code": 404
}}"#,
            group_kind,
            res.name_any(),
            res.name_any(),
            details,
            api_resource.plural,
        )
    }

    pub fn api_server_response_conflict<T: Resource<DynamicType = ()>>(res: &T) -> String {
        let api_resource = ApiResource::erase::<T>(&());
        format!(
            r#"{{
  "kind": "Status",
  "apiVersion": "v1",
  "metadata": {{}},
  "status": "Failure",
  "message": "Operation cannot be fulfilled on {}.{} \"{}\": the object has been modified",
  "reason": "Conflict",
  "details": {{
    "name": "{}",
    "group": "{}",
    "kind": "{}"
  }},
  "code": 409
}}"#,
            api_resource.plural,
            api_resource.group,
            res.name_any(),
            res.name_any(),
            api_resource.group,
            api_resource.plural,
        )
    }

    pub fn api_server_response_resource<T: Resource<DynamicType = ()> + Serialize>(
        res: &T,
    ) -> Vec<u8> {
        serde_json::to_vec(res).unwrap()
    }

    pub fn test_kls(namespace: &str, backup: &str, restore: &str) -> KuberLogicService {
        KuberLogicService {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                uid: Some("demo-uid".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: KuberLogicServiceSpec {
                r#type: "postgresql".to_string(),
                replicas: Some(1),
                paused: None,
            },
            status: Some(KuberLogicServiceStatus {
                namespace: Some(namespace.to_string()),
                active_backup_name: backup.to_string(),
                active_restore_name: restore.to_string(),
            }),
        }
    }

    pub fn test_klb() -> KuberlogicServiceBackup {
        KuberlogicServiceBackup {
            metadata: ObjectMeta {
                name: Some("b1".to_string()),
                uid: Some("b1-uid".to_string()),
                finalizers: Some(vec![KUBERLOGIC_SERVICE_BACKUP_FINALIZER.to_string()]),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: KuberlogicServiceBackupSpec {
                kuberlogic_service_name: "demo".to_string(),
            },
            status: None,
        }
    }

    pub fn test_klb_with_phase(phase: Phase) -> KuberlogicServiceBackup {
        let mut klb = test_klb();
        klb.status_mut().phase = phase;
        klb
    }

    pub fn test_klr() -> KuberlogicServiceRestore {
        KuberlogicServiceRestore {
            metadata: ObjectMeta {
                name: Some("r1".to_string()),
                uid: Some("r1-uid".to_string()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: KuberlogicServiceRestoreSpec {
                kuberlogic_service_backup: "b1".to_string(),
            },
            status: None,
        }
    }

    pub fn test_klbs() -> KuberlogicServiceBackupSchedule {
        KuberlogicServiceBackupSchedule {
            metadata: ObjectMeta {
                name: Some("nightly".to_string()),
                namespace: Some("kuberlogic".to_string()),
                uid: Some("nightly-uid".to_string()),
                ..Default::default()
            },
            spec: KuberlogicServiceBackupScheduleSpec {
                kuberlogic_service_name: "demo".to_string(),
                schedule: "0 3 * * *".to_string(),
            },
        }
    }

    pub fn test_velero_backup() -> Backup {
        Backup {
            metadata: ObjectMeta {
                name: Some("b1".to_string()),
                namespace: Some("velero".to_string()),
                ..Default::default()
            },
            spec: BackupSpec {
                included_namespaces: vec!["demo".to_string()],
                storage_location: Some("default".to_string()),
                volume_snapshot_locations: vec!["default".to_string()],
                snapshot_volumes: Some(false),
            },
            status: None,
        }
    }

    pub fn test_pod(name: &str, phase: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("demo".to_string()),
                ..Default::default()
            },
            spec: None,
            status: phase.map(|p| PodStatus {
                phase: Some(p.to_string()),
                ..Default::default()
            }),
        }
    }

    /// In-memory provider recording the operations called on it.
    #[derive(Debug, Default)]
    pub struct FakeProvider {
        calls: Mutex<Vec<String>>,
        /// Phase reported by the status setters
        pub phase: Phase,
        /// Make request operations fail with a transient error
        pub fail_request: bool,
        pub panic_on_request: bool,
        /// Keep the provider side backup deletion unconfirmed
        pub deletion_pending: bool,
    }

    impl FakeProvider {
        pub fn with_phase(phase: Phase) -> Self {
            Self {
                phase,
                ..Default::default()
            }
        }

        pub fn failing() -> Self {
            Self {
                fail_request: true,
                ..Default::default()
            }
        }

        pub fn panicking() -> Self {
            Self {
                panic_on_request: true,
                ..Default::default()
            }
        }

        pub fn deleting() -> Self {
            Self {
                deletion_pending: true,
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn request(&self, call: &str) -> Result<(), Error> {
            self.record(call);
            if self.panic_on_request {
                panic!("{call} panicked");
            }
            if self.fail_request {
                return Err(Error::StorageUnavailable("default".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BackupProvider for FakeProvider {
        async fn backup_request(
            &self,
            _workload: &KuberLogicService,
            backup: &mut KuberlogicServiceBackup,
        ) -> Result<(), Error> {
            self.request("backup_request")?;
            backup.status_mut().backup_reference = Some(backup.name_any());
            Ok(())
        }

        async fn after_backup(
            &self,
            _workload: &KuberLogicService,
            _backup: &KuberlogicServiceBackup,
        ) -> Result<(), Error> {
            self.record("after_backup");
            Ok(())
        }

        async fn set_kuberlogic_backup_status(
            &self,
            backup: &mut KuberlogicServiceBackup,
        ) -> Result<(), Error> {
            self.record("set_kuberlogic_backup_status");
            backup.status_mut().set_phase(self.phase, None);
            Ok(())
        }

        async fn backup_delete_request(
            &self,
            backup: &KuberlogicServiceBackup,
        ) -> Result<(), Error> {
            self.record("backup_delete_request");
            if self.deletion_pending {
                return Err(Error::DeletionPending(backup.name_any()));
            }
            Ok(())
        }

        async fn restore_request(
            &self,
            _workload: &KuberLogicService,
            _backup: &KuberlogicServiceBackup,
            restore: &mut KuberlogicServiceRestore,
        ) -> Result<(), Error> {
            self.request("restore_request")?;
            restore.status_mut().restore_reference = Some(restore.name_any());
            Ok(())
        }

        async fn after_restore(
            &self,
            _workload: &KuberLogicService,
            _restore: &KuberlogicServiceRestore,
        ) -> Result<(), Error> {
            self.record("after_restore");
            Ok(())
        }

        async fn set_kuberlogic_restore_status(
            &self,
            restore: &mut KuberlogicServiceRestore,
        ) -> Result<(), Error> {
            self.record("set_kuberlogic_restore_status");
            restore.status_mut().set_phase(self.phase, None);
            Ok(())
        }
    }
}

pub async fn test_trace() {
    let _ = klbrd_trace::init::prepare_tracing(klbrd_trace::init::TraceConfig {
        level: "info".to_string(),
        format: String::new(),
        file: None,
        _metrics_endpoint: None,
    })
    .await;
}
