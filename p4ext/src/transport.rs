/*
Copyright (c) 2021 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! The seam between sessions and the wire.  `GrpcConnector` speaks gRPC to
//! real switches; `sim::SimNetwork` implements the same traits in process.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use proto::p4runtime::{
    ReadRequest,
    ReadResponse,
    SetForwardingPipelineConfigRequest,
    StreamMessageRequest,
    StreamMessageResponse,
    WriteRequest,
};
use proto::p4runtime_grpc::P4RuntimeClient;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Endpoint;
use tonic::Status;
use tracing::{event, Level};

use crate::{Delivery, P4Error};

pub type ResponseStream<T> = BoxStream<'static, Result<T, Status>>;

/// The four P4Runtime RPCs a session uses.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn stream_channel(
        &self,
        requests: BoxStream<'static, StreamMessageRequest>,
    ) -> Result<ResponseStream<StreamMessageResponse>, Status>;

    async fn set_forwarding_pipeline_config(&self, request: SetForwardingPipelineConfigRequest) -> Result<(), Status>;

    async fn write(&self, request: WriteRequest) -> Result<(), Status>;

    async fn read(&self, request: ReadRequest) -> Result<ResponseStream<ReadResponse>, Status>;
}

/// Creates transports.  Connecting is lazy: an unreachable address is only
/// discovered by the first RPC.
pub trait Connector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn Transport>, P4Error>;
}

#[derive(Clone, Debug)]
pub struct GrpcConnector {
    connect_timeout: Duration,
}

impl GrpcConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        GrpcConnector { connect_timeout }
    }
}

impl Default for GrpcConnector {
    fn default() -> Self {
        GrpcConnector::new(Duration::from_secs(5))
    }
}

impl Connector for GrpcConnector {
    fn connect(&self, address: &str) -> Result<Arc<dyn Transport>, P4Error> {
        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| P4Error::Transport {
                delivery: Delivery::NotSent,
                message: format!("invalid address {}: {}", address, e),
            })?
            .connect_timeout(self.connect_timeout)
            .tcp_nodelay(true);
        event!(Level::DEBUG, address, "created gRPC channel");
        Ok(Arc::new(GrpcTransport {
            client: P4RuntimeClient::new(endpoint.connect_lazy()),
        }))
    }
}

/// Concrete wrapper around the boxed request stream so the compiler can
/// prove the tonic call future is `Send` (rustc higher-ranked lifetime
/// limitation with `dyn Stream` arguments).
struct RequestStream(BoxStream<'static, StreamMessageRequest>);

impl futures::Stream for RequestStream {
    type Item = StreamMessageRequest;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.as_mut().poll_next(cx)
    }
}

pub struct GrpcTransport {
    client: P4RuntimeClient,
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn stream_channel(
        &self,
        requests: BoxStream<'static, StreamMessageRequest>,
    ) -> Result<ResponseStream<StreamMessageResponse>, Status> {
        let mut client = self.client.clone();
        let response = client.stream_channel(RequestStream(requests)).await?;
        Ok(response.into_inner().boxed())
    }

    async fn set_forwarding_pipeline_config(&self, request: SetForwardingPipelineConfigRequest) -> Result<(), Status> {
        let mut client = self.client.clone();
        client.set_forwarding_pipeline_config(request).await?;
        Ok(())
    }

    async fn write(&self, request: WriteRequest) -> Result<(), Status> {
        let mut client = self.client.clone();
        client.write(request).await?;
        Ok(())
    }

    async fn read(&self, request: ReadRequest) -> Result<ResponseStream<ReadResponse>, Status> {
        let mut client = self.client.clone();
        let response = client.read(request).await?;
        Ok(response.into_inner().boxed())
    }
}
